//! Runtime configuration, resolved from CLI arguments and environment.
//!
//! Precedence is CLI args > environment variables (clap's `env` attribute
//! handles both) > defaults. A `.env` file is loaded by the entrypoint before
//! parsing.

use std::net::SocketAddr;

use crate::error::{ParleyError, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite://parley.db";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token.
    pub bot_token: String,
    /// Secret path segment for the webhook endpoint; required to serve,
    /// unused when long-polling.
    pub webhook_secret: Option<String>,
    /// SQLite database URL.
    pub database_url: String,
    /// Webhook listener address.
    pub bind: SocketAddr,
}

impl Config {
    pub fn resolve(
        bot_token: Option<String>,
        webhook_secret: Option<String>,
        database_url: Option<String>,
        bind: Option<String>,
    ) -> Result<Config> {
        let bot_token = bot_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ParleyError::Config("PARLEY_BOT_TOKEN is required".to_string()))?;
        let bind_raw = bind.unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse()
            .map_err(|_| ParleyError::Config(format!("invalid bind address: {bind_raw}")))?;
        Ok(Config {
            bot_token,
            webhook_secret: webhook_secret.filter(|s| !s.trim().is_empty()),
            database_url: database_url.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            bind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::resolve(Some("123:abc".into()), None, None, None).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.webhook_secret, None);
    }

    #[test]
    fn test_missing_token_is_an_error() {
        assert!(Config::resolve(None, None, None, None).is_err());
        assert!(Config::resolve(Some("  ".into()), None, None, None).is_err());
    }

    #[test]
    fn test_invalid_bind_is_an_error() {
        let result = Config::resolve(Some("t".into()), None, None, Some("nonsense".into()));
        assert!(result.is_err());
    }
}
