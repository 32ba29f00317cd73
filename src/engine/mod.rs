//! The matching engine: derived indices, transactional store, the state
//! machine itself, and the scheduler driver that feeds it.

pub mod driver;
pub mod index;
pub mod matcher;
pub mod outbound;
pub mod store;

pub use driver::{Driver, InboundUpdate, OutboundBatch};
pub use matcher::{handle_input, Input};
pub use outbound::{MessageKind, OutboundMessage};
pub use store::{CommitBatch, Db, LogEvent, MemStore, Tx, WriterHandle};
