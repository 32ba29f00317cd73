//! The abstract message catalog the engine emits.
//!
//! The engine never renders text: it emits `MessageKind` values addressed to
//! a uid, and the Telegram adapter turns them into concrete API actions
//! (send / edit-last / delete-last / ack). Keeping the catalog abstract is
//! what keeps localization and keyboard layout out of the state machine.

use serde::Serialize;

use crate::model::{Cmd, Sex, Uid};

/// Everything the bot can say, as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// Input made no sense in the current state.
    Unexpected,
    Welcome,
    AskOpinion,
    TypeName,
    Registered,
    Inactive,
    Searching,
    /// Countdown refresh; edits the searching message in place.
    UpdateSearching { seconds_left: i64 },
    /// Mutual consent reached: here is who to call.
    FoundPartner {
        other_uid: Uid,
        other_name: String,
        other_sex: Sex,
    },
    AreYouAvailable { other_sex: Sex },
    AfterAskingTimedOut,
    AfterReplyUnavailable,
    SearchTimedOut,
    AfterStopSearch,
    HowWasTheCall,
    ThanksForAnswering { reply: Cmd },
}

/// One addressed message, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub uid: Uid,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl OutboundMessage {
    pub fn new(uid: Uid, kind: MessageKind) -> Self {
        OutboundMessage { uid, kind }
    }
}

/// What the adapter actually performs against the chat platform, in order.
///
/// The adapter owns one "last interactive message id" per uid; `EditLast`
/// and `DeleteLast` refer to it and are dropped when none is tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    Send {
        uid: Uid,
        kind: MessageKind,
        expects_reply: bool,
    },
    EditLast {
        uid: Uid,
        kind: MessageKind,
    },
    DeleteLast {
        uid: Uid,
    },
    AckCallback {
        callback_id: String,
    },
}
