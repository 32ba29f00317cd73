//! In-memory state store and the transaction layer over it.
//!
//! All reads and writes go through `MemStore`, which keeps the state map and
//! both derived indices in sync. `Db` adds the transactional surface the
//! matcher runs inside: a `Tx` applies writes to the in-memory store
//! immediately (reads observe the transaction's own writes) while
//! accumulating the dirty batch; closing the transaction hands the batch to
//! the async persistence writer. Transactions are not cancellable - what was
//! applied in-memory stays applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::clock::Timestamp;
use crate::error::{ParleyError, Result};
use crate::model::{Opinion, Uid, UserState};

use super::index::Indices;

/// State map plus derived indices.
#[derive(Debug, Default)]
pub struct MemStore {
    states: HashMap<Uid, UserState>,
    indices: Indices,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Rebuild from a plain state list (boot, tests). Index coherence holds
    /// by construction.
    pub fn rebuild(states: impl IntoIterator<Item = UserState>) -> Self {
        let mut store = MemStore::new();
        for state in states {
            store.set(state);
        }
        store
    }

    /// Current state for `uid`; a missing row is the virtual `Initial`.
    pub fn get(&self, uid: Uid) -> UserState {
        self.states
            .get(&uid)
            .cloned()
            .unwrap_or(UserState::Initial { uid })
    }

    pub fn set(&mut self, state: UserState) {
        self.indices.update(&state);
        self.states.insert(state.uid(), state);
    }

    /// Highest-priority candidate holding `opinion`, if any.
    pub fn search_for_user(&self, opinion: Opinion) -> Option<UserState> {
        let uid = self.indices.best_candidate(opinion)?;
        Some(self.get(uid))
    }

    /// The state with the earliest `sched`, if any user is scheduled.
    pub fn first_sched(&self) -> Option<UserState> {
        let uid = self.indices.first_sched()?;
        Some(self.get(uid))
    }

    pub fn states(&self) -> impl Iterator<Item = &UserState> {
        self.states.values()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn indices(&self) -> &Indices {
        &self.indices
    }
}

/// One structured event for the append-only `logs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub ts: Timestamp,
    pub kind: &'static str,
    pub data: serde_json::Value,
}

/// Everything one transaction changed, handed to the writer as a unit.
#[derive(Debug, Default)]
pub struct CommitBatch {
    pub states: Vec<UserState>,
    pub events: Vec<LogEvent>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.events.is_empty()
    }
}

/// Handle to the async persistence writer. The `failed` latch is set by the
/// writer task on any storage error and is never cleared.
#[derive(Clone)]
pub struct WriterHandle {
    sender: mpsc::UnboundedSender<CommitBatch>,
    failed: Arc<AtomicBool>,
}

impl WriterHandle {
    pub fn new(sender: mpsc::UnboundedSender<CommitBatch>, failed: Arc<AtomicBool>) -> Self {
        WriterHandle { sender, failed }
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn send(&self, batch: CommitBatch) -> Result<()> {
        self.sender
            .send(batch)
            .map_err(|_| ParleyError::StorageFailure)
    }
}

/// Read/write view inside one transaction. Writes hit the in-memory store
/// immediately; the dirty set keeps the last version per uid for the commit
/// batch.
pub struct Tx<'a> {
    mem: &'a mut MemStore,
    ts: Timestamp,
    dirty: HashMap<Uid, UserState>,
    events: Vec<LogEvent>,
}

impl Tx<'_> {
    pub fn now(&self) -> Timestamp {
        self.ts
    }

    pub fn get(&self, uid: Uid) -> UserState {
        self.mem.get(uid)
    }

    pub fn set(&mut self, state: UserState) {
        self.dirty.insert(state.uid(), state.clone());
        self.mem.set(state);
    }

    pub fn search_for_user(&self, opinion: Opinion) -> Option<UserState> {
        self.mem.search_for_user(opinion)
    }

    pub fn first_sched(&self) -> Option<UserState> {
        self.mem.first_sched()
    }

    /// Append a structured event to the persisted trail. Also traced.
    pub fn log(&mut self, kind: &'static str, data: serde_json::Value) {
        tracing::debug!(kind, %data, "event");
        self.events.push(LogEvent {
            ts: self.ts,
            kind,
            data,
        });
    }
}

/// The store plus the persistence collaborator.
///
/// `&mut self` on `transaction` is what enforces "only one transaction open
/// at a time" - the driver owns the `Db` and is the single entry point.
pub struct Db {
    mem: MemStore,
    writer: Option<WriterHandle>,
}

impl Db {
    /// Purely in-memory database (tests, dry runs): commits are dropped.
    pub fn in_memory(mem: MemStore) -> Self {
        Db { mem, writer: None }
    }

    pub fn with_writer(mem: MemStore, writer: WriterHandle) -> Self {
        Db {
            mem,
            writer: Some(writer),
        }
    }

    /// Run `f` inside a transaction at time `ts` and commit the result.
    ///
    /// If the writer has already failed, fails fast with `StorageFailure`
    /// before touching any state.
    pub fn transaction<T>(&mut self, ts: Timestamp, f: impl FnOnce(&mut Tx) -> T) -> Result<T> {
        if let Some(w) = &self.writer
            && w.has_failed()
        {
            return Err(ParleyError::StorageFailure);
        }
        let mut tx = Tx {
            mem: &mut self.mem,
            ts,
            dirty: HashMap::new(),
            events: Vec::new(),
        };
        let out = f(&mut tx);
        let batch = CommitBatch {
            states: tx.dirty.into_values().collect(),
            events: tx.events,
        };
        if let Some(w) = &self.writer
            && !batch.is_empty()
        {
            w.send(batch)?;
        }
        Ok(out)
    }

    /// Read-only peek used by the driver between transactions.
    pub fn first_sched(&self) -> Option<UserState> {
        self.mem.first_sched()
    }

    pub fn mem(&self) -> &MemStore {
        &self.mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Profile, Sex};

    fn inactive(uid: i64, opinion: Opinion, survey_at: Option<i64>) -> UserState {
        UserState::Inactive {
            uid: Uid(uid),
            profile: Profile {
                name: format!("u{uid}"),
                sex: Sex::Male,
                opinion,
            },
            survey_at: survey_at.map(Timestamp::from_secs),
        }
    }

    fn waiting(uid: i64, opinion: Opinion, until: i64) -> UserState {
        UserState::Waiting {
            uid: Uid(uid),
            profile: Profile {
                name: format!("u{uid}"),
                sex: Sex::Male,
                opinion,
            },
            searching_until: Timestamp::from_secs(until),
            next_refresh: Timestamp::from_secs(until - 5),
            waiting_for: None,
        }
    }

    #[test]
    fn test_get_missing_returns_virtual_initial() {
        let store = MemStore::new();
        assert_eq!(store.get(Uid(5)), UserState::Initial { uid: Uid(5) });
        assert!(store.is_empty());
    }

    #[test]
    fn test_search_for_user_reads_score_index() {
        let store = MemStore::rebuild([
            inactive(1, Opinion::Pro, None),
            waiting(2, Opinion::Pro, 10),
            waiting(3, Opinion::Pro, 7),
        ]);
        assert_eq!(store.search_for_user(Opinion::Pro).map(|s| s.uid()), Some(Uid(3)));
        assert_eq!(store.search_for_user(Opinion::Con), None);
    }

    #[test]
    fn test_first_sched_reads_sched_index() {
        let store = MemStore::rebuild([
            inactive(1, Opinion::Pro, Some(90)),
            waiting(2, Opinion::Con, 40),
            inactive(3, Opinion::Con, None),
        ]);
        // u2's next_refresh (35) precedes u1's survey (90).
        assert_eq!(store.first_sched().map(|s| s.uid()), Some(Uid(2)));
    }

    #[test]
    fn test_tx_reads_observe_own_writes() {
        let mut db = Db::in_memory(MemStore::new());
        let seen = db
            .transaction(Timestamp::from_secs(0), |tx| {
                tx.set(waiting(9, Opinion::Con, 30));
                tx.get(Uid(9))
            })
            .unwrap();
        assert_eq!(seen.uid(), Uid(9));
        // And the write survives the transaction.
        assert_eq!(db.mem().get(Uid(9)).uid(), Uid(9));
    }

    #[test]
    fn test_commit_batch_keeps_last_write_per_uid() {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let handle = WriterHandle::new(sender, Arc::new(AtomicBool::new(false)));
        let mut db = Db::with_writer(MemStore::new(), handle);

        db.transaction(Timestamp::from_secs(0), |tx| {
            tx.set(waiting(1, Opinion::Pro, 60));
            tx.set(inactive(1, Opinion::Pro, None));
            tx.log("test", serde_json::json!({"n": 1}));
        })
        .unwrap();

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.states.len(), 1);
        assert!(matches!(batch.states[0], UserState::Inactive { .. }));
        assert_eq!(batch.events.len(), 1);
    }

    #[test]
    fn test_failed_writer_blocks_next_transaction() {
        let (sender, _rx) = mpsc::unbounded_channel();
        let failed = Arc::new(AtomicBool::new(false));
        let handle = WriterHandle::new(sender, failed.clone());
        let mut db = Db::with_writer(MemStore::new(), handle);

        db.transaction(Timestamp::from_secs(0), |tx| {
            tx.set(waiting(1, Opinion::Pro, 60));
        })
        .unwrap();

        failed.store(true, Ordering::SeqCst);
        let err = db.transaction(Timestamp::from_secs(1), |_tx| ()).unwrap_err();
        assert!(matches!(err, ParleyError::StorageFailure));
    }

    #[test]
    fn test_rebuild_equals_incremental() {
        let states = [
            inactive(1, Opinion::Pro, Some(10)),
            waiting(2, Opinion::Con, 44),
            waiting(3, Opinion::Pro, 12),
        ];
        let mut incremental = MemStore::new();
        for s in &states {
            incremental.set(s.clone());
        }
        let rebuilt = MemStore::rebuild(states);
        for opinion in Opinion::ALL {
            assert_eq!(
                incremental.search_for_user(opinion).map(|s| s.uid()),
                rebuilt.search_for_user(opinion).map(|s| s.uid())
            );
        }
        assert_eq!(
            incremental.first_sched().map(|s| s.uid()),
            rebuilt.first_sched().map(|s| s.uid())
        );
    }
}
