//! Telegram adapter: wire models, the Bot API client, inbound update
//! classification and outbound rendering/delivery. The engine knows none of
//! this; it sees normalized inputs and emits abstract message kinds.

pub mod api;
pub mod inbound;
pub mod models;
pub mod outbound;
pub mod render;

pub use api::BotApi;
pub use inbound::{classify, poll_updates, router, WebhookState};
pub use outbound::OutboundWorker;
