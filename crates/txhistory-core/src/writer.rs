//! History writer: the storage contract for `tx_history`.
//!
//! Every backend enforces one row per signature. Writes are idempotent:
//! re-writing identical values is a no-op, different values overwrite (a
//! correction that only the reconciler produces in practice).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::HistoryError;
use crate::types::{
    HistoryEntry, ProvisionalEntry, QuarantineEntry, RecordState, Signature, Slot, TransactionRecord,
};

/// What a single upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    /// Identical row already present.
    Unchanged,
    /// Row existed with different values and was replaced.
    Overwritten,
}

impl UpsertOutcome {
    /// Compare the stored row (if any) with the incoming one.
    pub fn decide(existing: Option<&TransactionRecord>, incoming: &TransactionRecord) -> Self {
        match existing {
            None => Self::Inserted,
            Some(row) if row == incoming => Self::Unchanged,
            Some(_) => Self::Overwritten,
        }
    }
}

/// Counts of what a batch write did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub inserted: u64,
    pub unchanged: u64,
    pub overwritten: u64,
    pub quarantined: u64,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Overwritten => self.overwritten += 1,
        }
    }

    pub fn written(&self) -> u64 {
        self.inserted + self.unchanged + self.overwritten
    }
}

/// Checkpoint move applied together with a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointAdvance {
    pub pipeline_id: String,
    pub expected: Slot,
    pub to: Slot,
}

/// Everything one pipeline batch commits.
#[derive(Debug, Clone, Default)]
pub struct BatchCommit {
    pub entries: Vec<HistoryEntry>,
    pub quarantined: Vec<QuarantineEntry>,
    pub checkpoint: Option<CheckpointAdvance>,
}

/// Result of a combined commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub summary: BatchSummary,
    pub checkpoint: Option<Checkpoint>,
}

/// Storage contract for the history table and its bookkeeping tables.
#[async_trait]
pub trait HistoryStore: CheckpointStore {
    /// Idempotently write one record. Inserted or overwritten rows become
    /// provisional at the entry's slot; an unchanged row keeps its state.
    async fn upsert(&self, entry: &HistoryEntry) -> Result<UpsertOutcome, HistoryError>;

    /// Write a batch atomically: either every entry is visible or none is.
    async fn upsert_batch(&self, entries: &[HistoryEntry]) -> Result<BatchSummary, HistoryError>;

    /// Atomically apply entries, quarantine rows, and an optional checkpoint
    /// compare-and-advance. A `StaleCheckpoint` rolls back the whole commit.
    async fn commit_batch(&self, commit: &BatchCommit) -> Result<CommitResult, HistoryError>;

    async fn get(&self, signature: &Signature) -> Result<Option<TransactionRecord>, HistoryError>;

    /// Lifecycle state of a signature. Removed rows report `Unseen`.
    async fn state(&self, signature: &Signature) -> Result<RecordState, HistoryError>;

    /// Number of rows in `tx_history`.
    async fn count(&self) -> Result<u64, HistoryError>;

    /// Provisional entries with `slot > boundary`, ordered by slot.
    async fn provisional_after(&self, boundary: Slot) -> Result<Vec<ProvisionalEntry>, HistoryError>;

    /// Mark every provisional entry with `slot <= boundary` as final.
    /// Returns how many were finalized.
    async fn finalize_through(&self, boundary: Slot) -> Result<u64, HistoryError>;

    /// Update the slot of a provisional entry after re-inclusion elsewhere.
    async fn set_provisional_slot(&self, signature: &Signature, slot: Slot) -> Result<(), HistoryError>;

    /// Remove an orphaned record, but only while it is still provisional at
    /// `expected_slot` (the slot it was resolved at). Returns `false` if
    /// nothing was removed.
    async fn orphan(&self, signature: &Signature, expected_slot: Slot) -> Result<bool, HistoryError>;

    /// All quarantined transactions, oldest first.
    async fn quarantined(&self) -> Result<Vec<QuarantineEntry>, HistoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn rec(success: bool) -> TransactionRecord {
        TransactionRecord {
            signature: "sig".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            is_success: success,
            router_version: 3,
        }
    }

    #[test]
    fn decide_outcome() {
        assert_eq!(UpsertOutcome::decide(None, &rec(true)), UpsertOutcome::Inserted);
        assert_eq!(UpsertOutcome::decide(Some(&rec(true)), &rec(true)), UpsertOutcome::Unchanged);
        assert_eq!(
            UpsertOutcome::decide(Some(&rec(true)), &rec(false)),
            UpsertOutcome::Overwritten
        );
    }

    #[test]
    fn summary_counts() {
        let mut s = BatchSummary::default();
        s.record(UpsertOutcome::Inserted);
        s.record(UpsertOutcome::Inserted);
        s.record(UpsertOutcome::Unchanged);
        assert_eq!(s.inserted, 2);
        assert_eq!(s.written(), 3);
    }
}
