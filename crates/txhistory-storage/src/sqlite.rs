//! SQLite storage backend.
//!
//! Persists `tx_history`, its bookkeeping tables, and checkpoints to a single
//! SQLite file. SQLite has no schema namespaces, so the tables carry no
//! `router.` prefix. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use txhistory_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./history.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use txhistory_core::checkpoint::{Checkpoint, CheckpointStore};
use txhistory_core::error::HistoryError;
use txhistory_core::types::{
    HistoryEntry, ProvisionalEntry, QuarantineEntry, RecordState, Signature, Slot, TransactionRecord,
};
use txhistory_core::writer::{
    BatchCommit, BatchSummary, CheckpointAdvance, CommitResult, HistoryStore, UpsertOutcome,
};

fn storage_err(e: sqlx::Error) -> HistoryError {
    HistoryError::Storage(e.to_string())
}

/// SQLite-backed history storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./history.db"`) or a full
    /// SQLite URL (`"sqlite:./history.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, HistoryError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Limited to one connection: every pooled connection would otherwise get
    /// its own empty database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), HistoryError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // The history table itself: exactly the four consumer-facing columns.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tx_history (
                signature      TEXT    PRIMARY KEY,
                timestamp      INTEGER NOT NULL,
                is_success     BOOLEAN NOT NULL,
                router_version INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Rows still inside the finality window
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tx_provisional (
                signature TEXT    PRIMARY KEY,
                slot      INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tx_quarantine (
                signature   TEXT    PRIMARY KEY,
                slot        INTEGER NOT NULL,
                reason      TEXT    NOT NULL,
                detected_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                pipeline_id TEXT    PRIMARY KEY,
                slot        INTEGER NOT NULL,
                revision    INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_provisional_slot ON tx_provisional (slot);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

fn record_from_row(row: &SqliteRow) -> Result<TransactionRecord, HistoryError> {
    let secs: i64 = row.try_get("timestamp").map_err(storage_err)?;
    let timestamp = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| HistoryError::Storage(format!("invalid stored timestamp {secs}")))?;
    Ok(TransactionRecord {
        signature: Signature::new(row.try_get::<String, _>("signature").map_err(storage_err)?),
        timestamp,
        is_success: row.try_get("is_success").map_err(storage_err)?,
        router_version: row.try_get::<i64, _>("router_version").map_err(storage_err)? as u16,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, HistoryError> {
    Ok(Checkpoint {
        pipeline_id: row.try_get("pipeline_id").map_err(storage_err)?,
        slot: row.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
        revision: row.try_get::<i64, _>("revision").map_err(storage_err)? as u64,
        updated_at: row.try_get("updated_at").map_err(storage_err)?,
    })
}

async fn fetch_record(
    conn: &mut SqliteConnection,
    signature: &Signature,
) -> Result<Option<TransactionRecord>, HistoryError> {
    let row = sqlx::query(
        "SELECT signature, timestamp, is_success, router_version
         FROM tx_history WHERE signature = ?",
    )
    .bind(signature.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    row.as_ref().map(record_from_row).transpose()
}

async fn fetch_checkpoint(
    conn: &mut SqliteConnection,
    pipeline_id: &str,
) -> Result<Option<Checkpoint>, HistoryError> {
    let row = sqlx::query(
        "SELECT pipeline_id, slot, revision, updated_at FROM checkpoints WHERE pipeline_id = ?",
    )
    .bind(pipeline_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    row.as_ref().map(checkpoint_from_row).transpose()
}

async fn apply_entry(
    conn: &mut SqliteConnection,
    entry: &HistoryEntry,
) -> Result<UpsertOutcome, HistoryError> {
    let record = &entry.record;
    let existing = fetch_record(conn, &record.signature).await?;
    let outcome = UpsertOutcome::decide(existing.as_ref(), record);

    match outcome {
        UpsertOutcome::Unchanged => {
            sqlx::query("UPDATE tx_provisional SET slot = ? WHERE signature = ?")
                .bind(entry.slot as i64)
                .bind(record.signature.as_str())
                .execute(&mut *conn)
                .await
                .map_err(storage_err)?;
        }
        UpsertOutcome::Inserted | UpsertOutcome::Overwritten => {
            sqlx::query(
                "INSERT INTO tx_history (signature, timestamp, is_success, router_version)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (signature) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    is_success = excluded.is_success,
                    router_version = excluded.router_version",
            )
            .bind(record.signature.as_str())
            .bind(record.timestamp.timestamp())
            .bind(record.is_success)
            .bind(record.router_version as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

            sqlx::query(
                "INSERT INTO tx_provisional (signature, slot) VALUES (?, ?)
                 ON CONFLICT (signature) DO UPDATE SET slot = excluded.slot",
            )
            .bind(record.signature.as_str())
            .bind(entry.slot as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

            debug!(signature = %record.signature, slot = entry.slot, ?outcome, "history row written");
        }
    }
    Ok(outcome)
}

async fn advance_checkpoint(
    conn: &mut SqliteConnection,
    adv: &CheckpointAdvance,
) -> Result<Checkpoint, HistoryError> {
    let result = sqlx::query(
        "UPDATE checkpoints SET slot = ?, revision = revision + 1, updated_at = ?
         WHERE pipeline_id = ? AND slot = ? AND slot < ?",
    )
    .bind(adv.to as i64)
    .bind(Utc::now().timestamp())
    .bind(&adv.pipeline_id)
    .bind(adv.expected as i64)
    .bind(adv.to as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;

    let stored = fetch_checkpoint(conn, &adv.pipeline_id).await?.ok_or_else(|| {
        HistoryError::Storage(format!("checkpoint for '{}' not initialized", adv.pipeline_id))
    })?;
    if result.rows_affected() == 0 {
        return Err(HistoryError::StaleCheckpoint { stored: stored.slot, attempted: adv.to });
    }
    Ok(stored)
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, HistoryError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_checkpoint(&mut conn, pipeline_id).await
    }

    async fn initialize(&self, pipeline_id: &str, genesis: Slot) -> Result<Checkpoint, HistoryError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO checkpoints (pipeline_id, slot, revision, updated_at)
             VALUES (?, ?, 0, ?)
             ON CONFLICT (pipeline_id) DO NOTHING",
        )
        .bind(pipeline_id)
        .bind(genesis as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        fetch_checkpoint(&mut conn, pipeline_id)
            .await?
            .ok_or_else(|| HistoryError::Storage(format!("checkpoint for '{pipeline_id}' missing after insert")))
    }

    async fn advance(
        &self,
        pipeline_id: &str,
        expected: Slot,
        to: Slot,
    ) -> Result<Checkpoint, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let cp = advance_checkpoint(
            &mut tx,
            &CheckpointAdvance { pipeline_id: pipeline_id.to_string(), expected, to },
        )
        .await?;
        tx.commit().await.map_err(storage_err)?;

        debug!(pipeline_id, slot = cp.slot, revision = cp.revision, "checkpoint advanced");
        Ok(cp)
    }
}

// ─── HistoryStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl HistoryStore for SqliteStorage {
    async fn upsert(&self, entry: &HistoryEntry) -> Result<UpsertOutcome, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let outcome = apply_entry(&mut tx, entry).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(outcome)
    }

    async fn upsert_batch(&self, entries: &[HistoryEntry]) -> Result<BatchSummary, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut summary = BatchSummary::default();
        for entry in entries {
            summary.record(apply_entry(&mut tx, entry).await?);
        }
        tx.commit()
            .await
            .map_err(|e| HistoryError::Storage(format!("commit batch: {e}")))?;
        Ok(summary)
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> Result<CommitResult, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Checkpoint first: a stale advance drops the transaction untouched.
        let checkpoint = match &commit.checkpoint {
            Some(adv) => Some(advance_checkpoint(&mut tx, adv).await?),
            None => None,
        };

        let mut summary = BatchSummary::default();
        for entry in &commit.entries {
            summary.record(apply_entry(&mut tx, entry).await?);
        }

        for q in &commit.quarantined {
            sqlx::query(
                "INSERT INTO tx_quarantine (signature, slot, reason, detected_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (signature) DO UPDATE SET
                    slot = excluded.slot,
                    reason = excluded.reason,
                    detected_at = excluded.detected_at",
            )
            .bind(q.signature.as_str())
            .bind(q.slot as i64)
            .bind(&q.reason)
            .bind(q.detected_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
            summary.quarantined += 1;
        }

        tx.commit()
            .await
            .map_err(|e| HistoryError::Storage(format!("commit batch: {e}")))?;

        Ok(CommitResult { summary, checkpoint })
    }

    async fn get(&self, signature: &Signature) -> Result<Option<TransactionRecord>, HistoryError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        fetch_record(&mut conn, signature).await
    }

    async fn state(&self, signature: &Signature) -> Result<RecordState, HistoryError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM tx_provisional WHERE signature = ?) AS provisional,
                (SELECT COUNT(*) FROM tx_history WHERE signature = ?) AS stored",
        )
        .bind(signature.as_str())
        .bind(signature.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let provisional: i64 = row.try_get("provisional").map_err(storage_err)?;
        let stored: i64 = row.try_get("stored").map_err(storage_err)?;
        Ok(match (provisional > 0, stored > 0) {
            (true, _) => RecordState::Provisional,
            (false, true) => RecordState::Final,
            (false, false) => RecordState::Unseen,
        })
    }

    async fn count(&self) -> Result<u64, HistoryError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM tx_history")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    async fn provisional_after(&self, boundary: Slot) -> Result<Vec<ProvisionalEntry>, HistoryError> {
        let rows = sqlx::query(
            "SELECT signature, slot FROM tx_provisional
             WHERE slot > ? ORDER BY slot, signature",
        )
        .bind(boundary as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                Ok(ProvisionalEntry {
                    signature: Signature::new(r.try_get::<String, _>("signature").map_err(storage_err)?),
                    slot: r.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
                })
            })
            .collect()
    }

    async fn finalize_through(&self, boundary: Slot) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM tx_provisional WHERE slot <= ?")
            .bind(boundary as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(boundary, finalized = result.rows_affected(), "provisional rows finalized");
        Ok(result.rows_affected())
    }

    async fn set_provisional_slot(&self, signature: &Signature, slot: Slot) -> Result<(), HistoryError> {
        sqlx::query("UPDATE tx_provisional SET slot = ? WHERE signature = ?")
            .bind(slot as i64)
            .bind(signature.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn orphan(&self, signature: &Signature, expected_slot: Slot) -> Result<bool, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let unmarked = sqlx::query("DELETE FROM tx_provisional WHERE signature = ? AND slot = ?")
            .bind(signature.as_str())
            .bind(expected_slot as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if unmarked.rows_affected() == 0 {
            tx.rollback().await.map_err(storage_err)?;
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM tx_history WHERE signature = ?")
            .bind(signature.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn quarantined(&self) -> Result<Vec<QuarantineEntry>, HistoryError> {
        let rows = sqlx::query(
            "SELECT signature, slot, reason, detected_at FROM tx_quarantine
             ORDER BY detected_at, slot",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                Ok(QuarantineEntry {
                    signature: Signature::new(r.try_get::<String, _>("signature").map_err(storage_err)?),
                    slot: r.try_get::<i64, _>("slot").map_err(storage_err)? as u64,
                    reason: r.try_get("reason").map_err(storage_err)?,
                    detected_at: r.try_get("detected_at").map_err(storage_err)?,
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sig: &str, slot: Slot, success: bool, version: u16) -> HistoryEntry {
        HistoryEntry::new(
            TransactionRecord {
                signature: sig.into(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + slot as i64, 0).unwrap(),
                is_success: success,
                router_version: version,
            },
            slot,
        )
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_initialize_is_idempotent() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load("router").await.unwrap().is_none());

        let cp = store.initialize("router", 1_000).await.unwrap();
        assert_eq!(cp.slot, 1_000);
        assert_eq!(cp.revision, 0);

        store.advance("router", 1_000, 1_100).await.unwrap();
        // a later initialize never resets progress
        let cp = store.initialize("router", 1_000).await.unwrap();
        assert_eq!(cp.slot, 1_100);
        assert_eq!(cp.revision, 1);
    }

    #[tokio::test]
    async fn checkpoint_advance_rejects_stale_and_backwards() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.initialize("router", 100).await.unwrap();
        store.advance("router", 100, 200).await.unwrap();

        let err = store.advance("router", 100, 300).await.unwrap_err();
        assert_eq!(err, HistoryError::StaleCheckpoint { stored: 200, attempted: 300 });

        let err = store.advance("router", 200, 150).await.unwrap_err();
        assert!(err.is_stale_checkpoint());

        let err = store.advance("missing", 0, 1).await.unwrap_err();
        assert!(matches!(err, HistoryError::Storage(_)));
    }

    // ── History rows ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_roundtrip_and_idempotence() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let e = entry("sig-a", 10, true, 3);

        assert_eq!(store.upsert(&e).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&e).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.count().await.unwrap(), 1);

        let loaded = store.get(&"sig-a".into()).await.unwrap().unwrap();
        assert_eq!(loaded, e.record);

        let changed = entry("sig-a", 12, false, 3);
        assert_eq!(store.upsert(&changed).await.unwrap(), UpsertOutcome::Overwritten);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(!store.get(&"sig-a".into()).await.unwrap().unwrap().is_success);
    }

    #[tokio::test]
    async fn stale_commit_rolls_back_rows() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.initialize("router", 100).await.unwrap();

        let commit = BatchCommit {
            entries: vec![entry("sig-a", 101, true, 3)],
            quarantined: vec![],
            checkpoint: Some(CheckpointAdvance {
                pipeline_id: "router".into(),
                expected: 50,
                to: 110,
            }),
        };
        assert!(store.commit_batch(&commit).await.unwrap_err().is_stale_checkpoint());
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.load("router").await.unwrap().unwrap().slot, 100);
    }

    #[tokio::test]
    async fn commit_batch_writes_everything() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.initialize("router", 100).await.unwrap();

        let commit = BatchCommit {
            entries: vec![entry("sig-a", 101, true, 3), entry("sig-b", 104, false, 2)],
            quarantined: vec![QuarantineEntry {
                signature: "sig-q".into(),
                slot: 102,
                reason: "unknown router version 9".into(),
                detected_at: 1_700_000_000,
            }],
            checkpoint: Some(CheckpointAdvance {
                pipeline_id: "router".into(),
                expected: 100,
                to: 110,
            }),
        };
        let result = store.commit_batch(&commit).await.unwrap();
        assert_eq!(result.summary.inserted, 2);
        assert_eq!(result.summary.quarantined, 1);
        assert_eq!(result.checkpoint.unwrap().slot, 110);

        let q = store.quarantined().await.unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].reason, "unknown router version 9");
        // quarantined signatures never reach tx_history
        assert!(store.get(&"sig-q".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provisional_lifecycle() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store
            .upsert_batch(&[
                entry("sig-a", 10, true, 3),
                entry("sig-b", 20, true, 3),
                entry("sig-c", 30, false, 3),
            ])
            .await
            .unwrap();

        assert_eq!(store.finalize_through(20).await.unwrap(), 2);
        assert_eq!(store.state(&"sig-a".into()).await.unwrap(), RecordState::Final);
        assert_eq!(store.state(&"sig-c".into()).await.unwrap(), RecordState::Provisional);

        store.set_provisional_slot(&"sig-c".into(), 33).await.unwrap();
        let pending = store.provisional_after(20).await.unwrap();
        assert_eq!(pending, vec![ProvisionalEntry { signature: "sig-c".into(), slot: 33 }]);

        // resolved at its old slot: the move since then keeps the row
        assert!(!store.orphan(&"sig-c".into(), 30).await.unwrap());
        assert_eq!(store.state(&"sig-c".into()).await.unwrap(), RecordState::Provisional);
        // final rows are out of reach
        assert!(!store.orphan(&"sig-a".into(), 10).await.unwrap());

        assert!(store.orphan(&"sig-c".into(), 33).await.unwrap());
        assert_eq!(store.state(&"sig-c".into()).await.unwrap(), RecordState::Unseen);
        assert!(store.provisional_after(0).await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_backed_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "txhistory-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path_str = path.to_string_lossy().to_string();
        {
            let store = SqliteStorage::open(&path_str).await.unwrap();
            store.initialize("router", 0).await.unwrap();
            store.upsert(&entry("sig-a", 5, true, 3)).await.unwrap();
            store.advance("router", 0, 5).await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStorage::open(&path_str).await.unwrap();
        assert_eq!(store.load("router").await.unwrap().unwrap().slot, 5);
        assert_eq!(store.count().await.unwrap(), 1);
        store.pool.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
