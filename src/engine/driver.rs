//! The scheduler driver: the single consumer that feeds the matcher.
//!
//! Two producers - the inbound adapter and time itself - and one consumer.
//! The loop drains due wake-ups first, then waits for whichever comes first:
//! an inbound update or the earliest scheduled timestamp. There is exactly
//! one matcher invocation in flight at any moment, which is the whole
//! concurrency story of the engine.

use tokio::sync::{mpsc, watch};

use crate::clock::Timestamp;
use crate::error::Result;
use crate::model::{Opinion, Sex, Uid};

use super::matcher::{handle_input, Input};
use super::outbound::OutboundMessage;
use super::store::Db;

/// A classified update from the adapter, FIFO per user.
#[derive(Debug)]
pub struct InboundUpdate {
    pub uid: Uid,
    pub input: Input,
    /// Callback query id to acknowledge, for button presses.
    pub callback_id: Option<String>,
}

/// One matcher invocation's output, handed to the outbound worker after the
/// state is committed. Messages carry the recipient's rendering audience so
/// the worker needs no store access.
#[derive(Debug)]
pub struct OutboundBatch {
    pub ack: Option<String>,
    pub messages: Vec<AddressedMessage>,
}

#[derive(Debug)]
pub struct AddressedMessage {
    pub msg: OutboundMessage,
    pub audience: Option<(Sex, Opinion)>,
}

pub struct Driver {
    db: Db,
    inbound: mpsc::Receiver<InboundUpdate>,
    outbound: mpsc::Sender<OutboundBatch>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    pub fn new(
        db: Db,
        inbound: mpsc::Receiver<InboundUpdate>,
        outbound: mpsc::Sender<OutboundBatch>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Driver {
            db,
            inbound,
            outbound,
            shutdown,
        }
    }

    /// Run until the inbound channel closes, shutdown is signalled, or
    /// persistence fails. A `StorageFailure` escapes here and terminates the
    /// process: the operator must restart.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("scheduler driver started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Some(uid) = due_tick(&self.db, Timestamp::now()) {
                self.dispatch(uid, Input::Tick, None).await?;
                continue;
            }
            let budget = sleep_budget(&self.db, Timestamp::now());
            tokio::select! {
                maybe = self.inbound.recv() => match maybe {
                    Some(update) => {
                        self.dispatch(update.uid, update.input, update.callback_id)
                            .await?;
                    }
                    None => break,
                },
                _ = sleep_or_forever(budget) => {
                    // Loop around and dispatch the now-due tick.
                }
                _ = self.shutdown.changed() => {}
            }
        }
        tracing::info!("scheduler driver stopped");
        Ok(())
    }

    async fn dispatch(&mut self, uid: Uid, input: Input, ack: Option<String>) -> Result<()> {
        let ts = Timestamp::now();
        let msgs = self
            .db
            .transaction(ts, |tx| handle_input(tx, ts, uid, input))?;
        // State is committed; only now does anything leave the process.
        let messages: Vec<AddressedMessage> = msgs
            .into_iter()
            .map(|msg| AddressedMessage {
                audience: self.db.mem().get(msg.uid).audience(),
                msg,
            })
            .collect();
        if ack.is_some() || !messages.is_empty() {
            // A closed outbound channel means we are shutting down.
            let _ = self.outbound.send(OutboundBatch { ack, messages }).await;
        }
        Ok(())
    }
}

/// The uid whose `sched` is due at `now`, if any.
fn due_tick(db: &Db, now: Timestamp) -> Option<Uid> {
    let state = db.first_sched()?;
    let at = state.sched()?;
    (at <= now).then(|| state.uid())
}

/// How long the loop may sleep before the next wake-up; `None` means no one
/// is scheduled.
fn sleep_budget(db: &Db, now: Timestamp) -> Option<std::time::Duration> {
    let at = db.first_sched()?.sched()?;
    Some((at - now).as_std().unwrap_or_default())
}

async fn sleep_or_forever(budget: Option<std::time::Duration>) {
    match budget {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::MemStore;
    use crate::model::{Profile, UserState};

    fn waiting(uid: i64, next_refresh: i64) -> UserState {
        UserState::Waiting {
            uid: Uid(uid),
            profile: Profile {
                name: format!("u{uid}"),
                sex: Sex::Male,
                opinion: Opinion::Pro,
            },
            searching_until: Timestamp::from_secs(next_refresh + 30),
            next_refresh: Timestamp::from_secs(next_refresh),
            waiting_for: None,
        }
    }

    #[test]
    fn test_due_tick_picks_earliest_due() {
        let db = Db::in_memory(MemStore::rebuild([waiting(1, 10), waiting(2, 5)]));
        assert_eq!(due_tick(&db, Timestamp::from_secs(7)), Some(Uid(2)));
        assert_eq!(due_tick(&db, Timestamp::from_secs(3)), None);
    }

    #[test]
    fn test_sleep_budget_until_next_sched() {
        let db = Db::in_memory(MemStore::rebuild([waiting(1, 10)]));
        assert_eq!(
            sleep_budget(&db, Timestamp::from_secs(4)),
            Some(std::time::Duration::from_secs(6))
        );
        // Already due: zero budget, the loop re-checks immediately.
        assert_eq!(
            sleep_budget(&db, Timestamp::from_secs(30)),
            Some(std::time::Duration::ZERO)
        );
        let empty = Db::in_memory(MemStore::new());
        assert_eq!(sleep_budget(&empty, Timestamp::from_secs(0)), None);
    }
}
