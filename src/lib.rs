//! parley - pairs Telegram users holding opposing opinions for
//! one-on-one voice calls.
//!
//! The matching engine (`engine`) is a deterministic per-user state machine:
//! it consumes normalized inputs and a timestamp, and emits state transitions
//! plus an ordered list of outbound messages. Everything else - the Telegram
//! adapter, SQLite persistence, rendering - talks to it through narrow
//! interfaces.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod telegram;

pub use error::{ParleyError, Result};
