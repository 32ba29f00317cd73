//! SQLite persistence.
//!
//! The database works like a write-behind journal: everything lives in memory
//! and is loaded in full on boot; transactions are appended asynchronously by
//! a dedicated writer task that owns the single pooled connection. The
//! connection holds SQLite's exclusive locking mode, so a second process
//! pointing at the same file fails instead of silently sharing the dataset.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::store::{CommitBatch, WriterHandle};
use crate::error::{ParleyError, Result};
use crate::model::{Uid, UserState};

const SCHEMA_STATES: &str = "\
CREATE TABLE IF NOT EXISTS states (
    uid   INTEGER PRIMARY KEY,
    state TEXT NOT NULL
)";

const SCHEMA_LOGS: &str = "\
CREATE TABLE IF NOT EXISTS logs (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    ts   INTEGER NOT NULL,
    kind TEXT NOT NULL,
    data TEXT NOT NULL
)";

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if needed) and take ownership of the database file.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(std::time::Duration::from_secs(2));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Storage { pool };
        // First writes; with exclusive locking mode this also claims the
        // single-writer lock, so a concurrent owner fails here.
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA_STATES).execute(&self.pool).await?;
        sqlx::query(SCHEMA_LOGS).execute(&self.pool).await?;
        Ok(())
    }

    /// Load every persisted state. An unknown tag is a fatal error: it means
    /// the file was written by a newer build, and matching on top of a
    /// partially-understood dataset would corrupt it.
    pub async fn load_all(&self) -> Result<Vec<UserState>> {
        let rows = sqlx::query("SELECT uid, state FROM states")
            .fetch_all(&self.pool)
            .await?;
        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let uid: i64 = row.try_get("uid")?;
            let json: String = row.try_get("state")?;
            let state = serde_json::from_str(&json).map_err(|source| {
                ParleyError::CorruptState {
                    uid: Uid(uid),
                    source,
                }
            })?;
            states.push(state);
        }
        Ok(states)
    }

    /// Write one commit batch: state upserts plus log appends, atomically.
    pub async fn persist_batch(&self, batch: &CommitBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for state in &batch.states {
            let json = serde_json::to_string(state).map_err(|source| {
                ParleyError::CorruptState {
                    uid: state.uid(),
                    source,
                }
            })?;
            sqlx::query(
                "INSERT INTO states (uid, state) VALUES (?1, ?2) \
                 ON CONFLICT(uid) DO UPDATE SET state = excluded.state",
            )
            .bind(state.uid().0)
            .bind(json)
            .execute(&mut *tx)
            .await?;
        }
        for event in &batch.events {
            sqlx::query("INSERT INTO logs (ts, kind, data) VALUES (?1, ?2, ?3)")
                .bind(event.ts.as_secs())
                .bind(event.kind)
                .bind(event.data.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Spawn the background writer owning `storage`. The returned handle is what
/// the `Db` commits into; on any write error the failure latch is set and the
/// task exits, which surfaces as `StorageFailure` on the next transaction.
pub fn spawn_writer(storage: Storage) -> (WriterHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<CommitBatch>();
    let failed = Arc::new(AtomicBool::new(false));
    let handle = WriterHandle::new(sender, failed.clone());
    let join = tokio::spawn(async move {
        while let Some(batch) = receiver.recv().await {
            match storage.persist_batch(&batch).await {
                Ok(()) => {
                    tracing::debug!(
                        states = batch.states.len(),
                        events = batch.events.len(),
                        "stored transaction"
                    );
                }
                Err(e) => {
                    tracing::error!("persistence writer failed: {e}");
                    failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    });
    (handle, join)
}
