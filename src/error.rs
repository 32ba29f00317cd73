//! Error types shared across the crate.

use thiserror::Error;

use crate::model::Uid;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    /// The async persistence writer died. Latched: every transaction opened
    /// after the failure returns this until the process is restarted.
    #[error("persistence writer failed; refusing further transactions")]
    StorageFailure,

    #[error("corrupt state row for uid {uid}: {source}")]
    CorruptState {
        uid: Uid,
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Telegram rejected a method call with `ok: false`.
    #[error("telegram API error: {description}")]
    Telegram { description: String },
}

pub type Result<T> = std::result::Result<T, ParleyError>;
