//! Thin Bot API client over the shared HTTP connection pool.
//!
//! Error classification matters more than convenience here: a rate limit or
//! dropped connection is transient and worth a bounded retry; an `ok: false`
//! rejection for anything but a callback ack is final for that message.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

use super::models::{
    AnswerCallbackQuery, DeleteMessage, EditMessageText, GetUpdates, Message, SendMessage, Update,
};

/// Request timeout for ordinary method calls; long polls get their own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded retry for transient failures before a message is dropped.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Clone)]
pub struct BotApi {
    client: reqwest::Client,
    base: String,
}

impl BotApi {
    pub fn new(token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        BotApi {
            client,
            base: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, payload: &P) -> Result<R> {
        let response: ApiResponse<R> = self
            .client
            .post(format!("{}/{}", self.base, method))
            .json(payload)
            .send()
            .await?
            .json()
            .await?;
        if response.ok {
            response.result.ok_or_else(|| ParleyError::Telegram {
                description: format!("{method}: ok response without result"),
            })
        } else {
            Err(ParleyError::Telegram {
                description: response
                    .description
                    .unwrap_or_else(|| format!("{method}: request rejected")),
            })
        }
    }

    /// Retry transient failures, give up on permanent rejections.
    async fn call_with_retry<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        payload: &P,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call(method, payload).await {
                Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::warn!("{method} attempt {attempt} failed, retrying: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    pub async fn send_message(&self, payload: &SendMessage) -> Result<Message> {
        self.call_with_retry("sendMessage", payload).await
    }

    pub async fn edit_message_text(&self, payload: &EditMessageText) -> Result<()> {
        // The edited Message comes back; nothing downstream needs it.
        self.call_with_retry::<_, serde_json::Value>("editMessageText", payload)
            .await
            .map(|_| ())
    }

    pub async fn delete_message(&self, payload: &DeleteMessage) -> Result<()> {
        self.call_with_retry::<_, serde_json::Value>("deleteMessage", payload)
            .await
            .map(|_| ())
    }

    /// Ack failures are always swallowed: the button stops spinning on its
    /// own eventually, and the press itself was already processed.
    pub async fn answer_callback(&self, callback_query_id: &str) {
        let payload = AnswerCallbackQuery {
            callback_query_id: callback_query_id.to_string(),
        };
        if let Err(e) = self
            .call::<_, serde_json::Value>("answerCallbackQuery", &payload)
            .await
        {
            tracing::debug!("answerCallbackQuery failed (ignored): {e}");
        }
    }

    /// Long-poll for updates (development mode).
    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: i64) -> Result<Vec<Update>> {
        let payload = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: vec!["message", "callback_query"],
        };
        let response: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.base))
            .timeout(Duration::from_secs(timeout_secs as u64 + 5))
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if response.ok {
            Ok(response.result.unwrap_or_default())
        } else {
            Err(ParleyError::Telegram {
                description: response
                    .description
                    .unwrap_or_else(|| "getUpdates: request rejected".to_string()),
            })
        }
    }
}

/// Network-level failures are worth retrying; API rejections are not.
fn is_transient(err: &ParleyError) -> bool {
    match err {
        ParleyError::Http(e) => !e.is_builder(),
        ParleyError::Telegram { description } => description.contains("Too Many Requests"),
        _ => false,
    }
}
