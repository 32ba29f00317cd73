//! Outbound delivery: abstract messages to concrete Bot API calls.
//!
//! Two stages. `translate` turns a committed batch into the ordered action
//! list of the adapter contract (ack, delete-last, edit-last, send), based on
//! which users currently have a tracked interactive message. The worker then
//! executes actions sequentially, maintaining the per-user "last interactive
//! message id": a send whose rendering carries an inline keyboard records the
//! returned id, anything else clears it.
//!
//! Failures follow the error-handling contract: acks are fire-and-forget,
//! transient errors were already retried by the API client, and a final
//! failure aborts the remaining actions for that user only - the matcher
//! state was committed before anything was sent, so a missed delivery just
//! looks like a button that needs pressing again.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, watch};

use crate::engine::driver::OutboundBatch;
use crate::engine::outbound::{MessageKind, OutboundAction};
use crate::model::{Cmd, Uid};

use super::api::BotApi;
use super::models::{
    DeleteMessage, EditMessageText, InlineKeyboardButton, InlineKeyboardMarkup, ReplyMarkup,
    SendMessage,
};
use super::render::{render, Audience};

/// Kinds that replace a pending interactive prompt (a countdown or an
/// "are you available?"); the stale prompt is deleted so its dead buttons
/// don't linger. Informative messages are never deleted.
fn supersedes_prompt(kind: &MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::FoundPartner { .. }
            | MessageKind::SearchTimedOut
            | MessageKind::AfterStopSearch
            | MessageKind::AfterAskingTimedOut
            | MessageKind::AfterReplyUnavailable
    )
}

/// Lower a batch into the ordered adapter actions.
pub fn translate(batch: &OutboundBatch, msg_ids: &HashMap<Uid, i64>) -> Vec<OutboundAction> {
    let mut actions = Vec::new();
    if let Some(id) = &batch.ack {
        actions.push(OutboundAction::AckCallback {
            callback_id: id.clone(),
        });
    }
    // Deletions are decided against the tracked ids as they will be when the
    // action runs, so track clears inline.
    let mut tracked: HashSet<Uid> = msg_ids.keys().copied().collect();
    for addressed in &batch.messages {
        let uid = addressed.msg.uid;
        let kind = &addressed.msg.kind;
        match kind {
            MessageKind::UpdateSearching { .. } => {
                actions.push(OutboundAction::EditLast {
                    uid,
                    kind: kind.clone(),
                });
            }
            _ => {
                if supersedes_prompt(kind) && tracked.contains(&uid) {
                    actions.push(OutboundAction::DeleteLast { uid });
                    tracked.remove(&uid);
                }
                actions.push(OutboundAction::Send {
                    uid,
                    kind: kind.clone(),
                    expects_reply: matches!(kind, MessageKind::TypeName),
                });
                // An interactive send will re-track below; model that here.
                tracked.insert(uid);
            }
        }
    }
    actions
}

fn keyboard_markup(rows: &[Vec<Cmd>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter_map(|cmd| {
                        cmd.callback_data().map(|data| InlineKeyboardButton {
                            text: super::render::button_label(*cmd).to_string(),
                            callback_data: data.to_string(),
                        })
                    })
                    .collect()
            })
            .collect(),
    }
}

pub struct OutboundWorker {
    api: BotApi,
    rx: mpsc::Receiver<OutboundBatch>,
    shutdown: watch::Receiver<bool>,
    /// Last interactive message id per user (one, not per conversation).
    msg_ids: HashMap<Uid, i64>,
    /// Rendering audience per message, rebuilt for each batch.
    audiences: HashMap<Uid, Audience>,
}

impl OutboundWorker {
    pub fn new(api: BotApi, rx: mpsc::Receiver<OutboundBatch>, shutdown: watch::Receiver<bool>) -> Self {
        OutboundWorker {
            api,
            rx,
            shutdown,
            msg_ids: HashMap::new(),
            audiences: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("outbound worker started");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(batch) => self.deliver(batch).await,
                    None => break,
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbound worker stopped");
    }

    async fn deliver(&mut self, batch: OutboundBatch) {
        self.audiences.clear();
        for addressed in &batch.messages {
            if let Some((sex, opinion)) = addressed.audience {
                self.audiences.insert(addressed.msg.uid, Audience { sex, opinion });
            }
        }
        let actions = translate(&batch, &self.msg_ids);
        let mut aborted: HashSet<Uid> = HashSet::new();
        for action in actions {
            match action {
                OutboundAction::AckCallback { callback_id } => {
                    self.api.answer_callback(&callback_id).await;
                }
                OutboundAction::Send {
                    uid,
                    kind,
                    expects_reply,
                } => {
                    if aborted.contains(&uid) {
                        continue;
                    }
                    if let Err(e) = self.send(uid, &kind, expects_reply).await {
                        tracing::warn!("send to {uid} failed, dropping rest of batch: {e}");
                        aborted.insert(uid);
                    }
                }
                OutboundAction::EditLast { uid, kind } => {
                    if aborted.contains(&uid) {
                        continue;
                    }
                    if let Err(e) = self.edit_last(uid, &kind).await {
                        tracing::warn!("edit for {uid} failed, dropping rest of batch: {e}");
                        aborted.insert(uid);
                    }
                }
                OutboundAction::DeleteLast { uid } => {
                    if aborted.contains(&uid) {
                        continue;
                    }
                    // A failed delete leaves a stale message behind; not
                    // worth aborting the user's real messages over.
                    if let Some(message_id) = self.msg_ids.remove(&uid) {
                        if let Err(e) = self
                            .api
                            .delete_message(&DeleteMessage {
                                chat_id: uid.0,
                                message_id,
                            })
                            .await
                        {
                            tracing::debug!("delete for {uid} failed (ignored): {e}");
                        }
                    }
                }
            }
        }
    }

    async fn send(&mut self, uid: Uid, kind: &MessageKind, expects_reply: bool) -> crate::Result<()> {
        let rendered = render(uid, kind, self.audiences.get(&uid).copied());
        let interactive = rendered.keyboard.is_some();
        let reply_markup = match &rendered.keyboard {
            Some(rows) => Some(ReplyMarkup::Inline(keyboard_markup(rows))),
            None if expects_reply => Some(ReplyMarkup::ForceReply { force_reply: true }),
            None => None,
        };
        let sent = self
            .api
            .send_message(&SendMessage {
                chat_id: uid.0,
                text: rendered.text,
                entities: rendered.entities,
                reply_markup,
            })
            .await?;
        // `Unexpected` nudges never take over the interactive slot.
        if matches!(kind, MessageKind::Unexpected) {
            return Ok(());
        }
        if interactive {
            self.msg_ids.insert(uid, sent.message_id);
        } else {
            self.msg_ids.remove(&uid);
        }
        Ok(())
    }

    async fn edit_last(&mut self, uid: Uid, kind: &MessageKind) -> crate::Result<()> {
        // No tracked interactive message: the countdown has already been
        // superseded, nothing to refresh.
        let Some(&message_id) = self.msg_ids.get(&uid) else {
            return Ok(());
        };
        let rendered = render(uid, kind, self.audiences.get(&uid).copied());
        self.api
            .edit_message_text(&EditMessageText {
                chat_id: uid.0,
                message_id,
                text: rendered.text,
                entities: rendered.entities,
                reply_markup: rendered.keyboard.as_deref().map(keyboard_markup),
            })
            .await
    }
}
