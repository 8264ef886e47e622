//! In-memory storage backend.
//!
//! Keeps history rows, provisional markers, quarantine entries, and
//! checkpoints in RAM behind a single lock, so every commit is atomic.
//! Useful for testing and short-lived pipelines that don't need persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use txhistory_core::checkpoint::{Checkpoint, CheckpointStore};
use txhistory_core::error::HistoryError;
use txhistory_core::types::{
    HistoryEntry, ProvisionalEntry, QuarantineEntry, RecordState, Signature, Slot, TransactionRecord,
};
use txhistory_core::writer::{BatchCommit, BatchSummary, CommitResult, HistoryStore, UpsertOutcome};

#[derive(Default)]
struct State {
    rows: HashMap<Signature, TransactionRecord>,
    provisional: HashMap<Signature, Slot>,
    quarantine: HashMap<Signature, QuarantineEntry>,
    checkpoints: HashMap<String, Checkpoint>,
}

impl State {
    fn apply(&mut self, entry: &HistoryEntry) -> UpsertOutcome {
        let sig = entry.signature();
        let outcome = UpsertOutcome::decide(self.rows.get(sig), &entry.record);
        match outcome {
            UpsertOutcome::Unchanged => {
                if let Some(slot) = self.provisional.get_mut(sig) {
                    *slot = entry.slot;
                }
            }
            UpsertOutcome::Inserted | UpsertOutcome::Overwritten => {
                self.rows.insert(sig.clone(), entry.record.clone());
                self.provisional.insert(sig.clone(), entry.slot);
            }
        }
        outcome
    }
}

/// In-memory history storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, HistoryError> {
        self.state
            .lock()
            .map_err(|_| HistoryError::Storage("in-memory store poisoned".into()))
    }

    /// All rows, ordered by signature.
    pub fn records(&self) -> Result<Vec<TransactionRecord>, HistoryError> {
        let mut rows: Vec<_> = self.lock()?.rows.values().cloned().collect();
        rows.sort_by(|a, b| a.signature.cmp(&b.signature));
        Ok(rows)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, HistoryError> {
        Ok(self.lock()?.checkpoints.get(pipeline_id).cloned())
    }

    async fn initialize(&self, pipeline_id: &str, genesis: Slot) -> Result<Checkpoint, HistoryError> {
        Ok(self
            .lock()?
            .checkpoints
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Checkpoint::genesis(pipeline_id, genesis))
            .clone())
    }

    async fn advance(
        &self,
        pipeline_id: &str,
        expected: Slot,
        to: Slot,
    ) -> Result<Checkpoint, HistoryError> {
        let mut state = self.lock()?;
        let next = state
            .checkpoints
            .get(pipeline_id)
            .ok_or_else(|| HistoryError::Storage(format!("checkpoint for '{pipeline_id}' not initialized")))?
            .advanced(expected, to)?;
        state.checkpoints.insert(pipeline_id.to_string(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl HistoryStore for InMemoryStorage {
    async fn upsert(&self, entry: &HistoryEntry) -> Result<UpsertOutcome, HistoryError> {
        Ok(self.lock()?.apply(entry))
    }

    async fn upsert_batch(&self, entries: &[HistoryEntry]) -> Result<BatchSummary, HistoryError> {
        let mut state = self.lock()?;
        let mut summary = BatchSummary::default();
        for entry in entries {
            summary.record(state.apply(entry));
        }
        Ok(summary)
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> Result<CommitResult, HistoryError> {
        let mut state = self.lock()?;

        // Validate the checkpoint move before touching anything.
        let next = match &commit.checkpoint {
            Some(adv) => Some(
                state
                    .checkpoints
                    .get(&adv.pipeline_id)
                    .ok_or_else(|| {
                        HistoryError::Storage(format!("checkpoint for '{}' not initialized", adv.pipeline_id))
                    })?
                    .advanced(adv.expected, adv.to)?,
            ),
            None => None,
        };

        let mut summary = BatchSummary::default();
        for entry in &commit.entries {
            summary.record(state.apply(entry));
        }
        for q in &commit.quarantined {
            state.quarantine.insert(q.signature.clone(), q.clone());
            summary.quarantined += 1;
        }
        if let Some(cp) = &next {
            state.checkpoints.insert(cp.pipeline_id.clone(), cp.clone());
        }

        Ok(CommitResult { summary, checkpoint: next })
    }

    async fn get(&self, signature: &Signature) -> Result<Option<TransactionRecord>, HistoryError> {
        Ok(self.lock()?.rows.get(signature).cloned())
    }

    async fn state(&self, signature: &Signature) -> Result<RecordState, HistoryError> {
        let state = self.lock()?;
        Ok(if state.provisional.contains_key(signature) {
            RecordState::Provisional
        } else if state.rows.contains_key(signature) {
            RecordState::Final
        } else {
            RecordState::Unseen
        })
    }

    async fn count(&self) -> Result<u64, HistoryError> {
        Ok(self.lock()?.rows.len() as u64)
    }

    async fn provisional_after(&self, boundary: Slot) -> Result<Vec<ProvisionalEntry>, HistoryError> {
        let mut pending: Vec<_> = self
            .lock()?
            .provisional
            .iter()
            .filter(|(_, slot)| **slot > boundary)
            .map(|(sig, slot)| ProvisionalEntry { signature: sig.clone(), slot: *slot })
            .collect();
        pending.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.signature.cmp(&b.signature)));
        Ok(pending)
    }

    async fn finalize_through(&self, boundary: Slot) -> Result<u64, HistoryError> {
        let mut state = self.lock()?;
        let before = state.provisional.len();
        state.provisional.retain(|_, slot| *slot > boundary);
        Ok((before - state.provisional.len()) as u64)
    }

    async fn set_provisional_slot(&self, signature: &Signature, slot: Slot) -> Result<(), HistoryError> {
        if let Some(s) = self.lock()?.provisional.get_mut(signature) {
            *s = slot;
        }
        Ok(())
    }

    async fn orphan(&self, signature: &Signature, expected_slot: Slot) -> Result<bool, HistoryError> {
        let mut state = self.lock()?;
        if state.provisional.get(signature) != Some(&expected_slot) {
            return Ok(false);
        }
        state.provisional.remove(signature);
        Ok(state.rows.remove(signature).is_some())
    }

    async fn quarantined(&self) -> Result<Vec<QuarantineEntry>, HistoryError> {
        let mut entries: Vec<_> = self.lock()?.quarantine.values().cloned().collect();
        entries.sort_by(|a, b| (a.detected_at, a.slot).cmp(&(b.detected_at, b.slot)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use txhistory_core::writer::CheckpointAdvance;

    fn entry(sig: &str, slot: Slot, success: bool) -> HistoryEntry {
        HistoryEntry::new(
            TransactionRecord {
                signature: sig.into(),
                timestamp: Utc.timestamp_opt(1_700_000_000 + slot as i64, 0).unwrap(),
                is_success: success,
                router_version: 3,
            },
            slot,
        )
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = InMemoryStorage::new();
        assert_eq!(store.upsert(&entry("a", 10, true)).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&entry("a", 10, true)).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.count().await.unwrap(), 1);

        assert_eq!(store.upsert(&entry("a", 10, false)).await.unwrap(), UpsertOutcome::Overwritten);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(!store.get(&"a".into()).await.unwrap().unwrap().is_success);
    }

    #[tokio::test]
    async fn finalize_and_orphan_lifecycle() {
        let store = InMemoryStorage::new();
        store
            .upsert_batch(&[entry("a", 10, true), entry("b", 20, true), entry("c", 30, true)])
            .await
            .unwrap();

        assert_eq!(store.finalize_through(20).await.unwrap(), 2);
        assert_eq!(store.state(&"a".into()).await.unwrap(), RecordState::Final);
        assert_eq!(store.state(&"c".into()).await.unwrap(), RecordState::Provisional);

        let pending = store.provisional_after(20).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signature.as_str(), "c");

        // the entry moved to slot 31 after it was resolved at 30
        store.set_provisional_slot(&"c".into(), 31).await.unwrap();
        assert!(!store.orphan(&"c".into(), 30).await.unwrap());
        assert_eq!(store.state(&"c".into()).await.unwrap(), RecordState::Provisional);

        assert!(store.orphan(&"c".into(), 31).await.unwrap());
        assert!(!store.orphan(&"c".into(), 31).await.unwrap());
        assert_eq!(store.state(&"c".into()).await.unwrap(), RecordState::Unseen);
        assert_eq!(store.count().await.unwrap(), 2);

        // re-delivering a final record leaves it final
        store.upsert(&entry("a", 10, true)).await.unwrap();
        assert_eq!(store.state(&"a".into()).await.unwrap(), RecordState::Final);
        assert!(!store.orphan(&"a".into(), 10).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_commit_applies_nothing() {
        let store = InMemoryStorage::new();
        store.initialize("p", 100).await.unwrap();

        let commit = BatchCommit {
            entries: vec![entry("a", 101, true)],
            quarantined: vec![],
            checkpoint: Some(CheckpointAdvance { pipeline_id: "p".into(), expected: 90, to: 110 }),
        };
        let err = store.commit_batch(&commit).await.unwrap_err();
        assert!(err.is_stale_checkpoint());
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.load("p").await.unwrap().unwrap().slot, 100);
    }

    #[tokio::test]
    async fn commit_moves_checkpoint_with_rows() {
        let store = InMemoryStorage::new();
        store.initialize("p", 100).await.unwrap();

        let commit = BatchCommit {
            entries: vec![entry("a", 101, true), entry("b", 105, false)],
            quarantined: vec![QuarantineEntry {
                signature: "q".into(),
                slot: 103,
                reason: "unknown router version 9".into(),
                detected_at: 1,
            }],
            checkpoint: Some(CheckpointAdvance { pipeline_id: "p".into(), expected: 100, to: 110 }),
        };
        let result = store.commit_batch(&commit).await.unwrap();
        assert_eq!(result.summary.inserted, 2);
        assert_eq!(result.summary.quarantined, 1);
        assert_eq!(result.checkpoint.unwrap().slot, 110);
        assert_eq!(store.quarantined().await.unwrap().len(), 1);
        assert_eq!(store.records().unwrap().len(), 2);
    }
}
