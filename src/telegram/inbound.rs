//! Inbound side of the adapter: webhook endpoint, long-poll fallback, and
//! the classification of raw updates into normalized engine inputs.
//!
//! Classification never fails toward the engine: unrecognized callback data
//! becomes `Callback { cmd: None }` (rendered as "I didn't understand") and
//! updates with no actionable content are dropped here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::{mpsc, watch};

use crate::engine::driver::InboundUpdate;
use crate::engine::matcher::Input;
use crate::model::{Cmd, Uid};

use super::api::BotApi;
use super::models::Update;

/// How long one getUpdates long poll is allowed to hang.
const POLL_TIMEOUT_SECS: i64 = 30;

/// Map a raw update to a normalized input, or `None` when there is nothing
/// for the engine in it.
pub fn classify(update: Update) -> Option<InboundUpdate> {
    if let Some(cb) = update.callback_query {
        let cmd = cb.data.as_deref().and_then(Cmd::from_callback_data);
        return Some(InboundUpdate {
            uid: Uid(cb.from.id),
            input: Input::Callback { cmd },
            callback_id: Some(cb.id),
        });
    }
    if let Some(message) = update.message {
        let uid = Uid(message.chat.id);
        let text = message.text.unwrap_or_default();
        let input = if text.trim() == "/start" {
            Input::Start {
                display_name: message.from.map(|u| u.full_name()).unwrap_or_default(),
            }
        } else {
            // Includes the empty string for non-text messages; the matcher
            // answers those with `Unexpected`.
            Input::Text { text }
        };
        return Some(InboundUpdate {
            uid,
            input,
            callback_id: None,
        });
    }
    None
}

/// Shared state for the webhook route.
#[derive(Clone)]
pub struct WebhookState {
    /// Secret path segment; requests with any other token get a 404.
    pub secret: String,
    pub inbound: mpsc::Sender<InboundUpdate>,
}

/// `POST /tg/{secret}` - the single externally visible endpoint.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/tg/{token}", post(webhook))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn webhook(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
    Json(update): Json<Update>,
) -> StatusCode {
    if token != state.secret {
        return StatusCode::NOT_FOUND;
    }
    if let Some(normalized) = classify(update) {
        // A full channel backpressures into Telegram's retry, which is fine.
        if state.inbound.send(normalized).await.is_err() {
            tracing::warn!("inbound channel closed; dropping update");
        }
    }
    StatusCode::OK
}

/// Development mode: long-poll getUpdates instead of serving a webhook.
/// Feeds the same channel the webhook would.
pub async fn poll_updates(
    api: BotApi,
    inbound: mpsc::Sender<InboundUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("long-polling for updates");
    let mut offset: Option<i64> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let updates = tokio::select! {
            result = api.get_updates(offset, POLL_TIMEOUT_SECS) => match result {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!("getUpdates failed, backing off: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => continue,
        };
        for update in updates {
            offset = Some(update.update_id + 1);
            if let Some(normalized) = classify(update) {
                if inbound.send(normalized).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::models::{CallbackQuery, Chat, Message, User};

    fn user(id: i64, name: &str) -> User {
        User {
            id,
            first_name: Some(name.to_string()),
            last_name: None,
        }
    }

    #[test]
    fn test_classify_start_command() {
        let update = Update {
            update_id: 1,
            message: Some(Message {
                message_id: 10,
                from: Some(user(5, "Dana")),
                chat: Chat { id: 5 },
                text: Some("/start".into()),
            }),
            callback_query: None,
        };
        let normalized = classify(update).unwrap();
        assert_eq!(normalized.uid, Uid(5));
        assert_eq!(
            normalized.input,
            Input::Start {
                display_name: "Dana".into()
            }
        );
        assert_eq!(normalized.callback_id, None);
    }

    #[test]
    fn test_classify_known_and_unknown_callbacks() {
        let known = Update {
            update_id: 2,
            message: None,
            callback_query: Some(CallbackQuery {
                id: "q1".into(),
                from: user(6, "Avi"),
                data: Some("available_now".into()),
            }),
        };
        let normalized = classify(known).unwrap();
        assert_eq!(
            normalized.input,
            Input::Callback {
                cmd: Some(Cmd::ImAvailableNow)
            }
        );
        assert_eq!(normalized.callback_id.as_deref(), Some("q1"));

        let unknown = Update {
            update_id: 3,
            message: None,
            callback_query: Some(CallbackQuery {
                id: "q2".into(),
                from: user(6, "Avi"),
                data: Some("sched".into()),
            }),
        };
        // Sched must not be producible from the wire.
        let normalized = classify(unknown).unwrap();
        assert_eq!(normalized.input, Input::Callback { cmd: None });
    }

    #[test]
    fn test_classify_plain_text_and_empty_update() {
        let text = Update {
            update_id: 4,
            message: Some(Message {
                message_id: 11,
                from: Some(user(7, "Noa")),
                chat: Chat { id: 7 },
                text: Some("Noa L.".into()),
            }),
            callback_query: None,
        };
        assert_eq!(
            classify(text).unwrap().input,
            Input::Text {
                text: "Noa L.".into()
            }
        );

        let empty = Update {
            update_id: 5,
            message: None,
            callback_query: None,
        };
        assert!(classify(empty).is_none());
    }
}
