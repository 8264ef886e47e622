//! Reorg reconciliation.
//!
//! Records inside the finality window (the most recent `finality_depth`
//! slots below the source head) are provisional. Each cycle:
//!
//! 1. entries at or below `head - finality_depth` become final and are never
//!    looked at again;
//! 2. every remaining provisional signature is re-resolved against the source:
//!    - still canonical and classifies the same → unchanged,
//!    - no longer canonical → the record is removed (orphaned),
//!    - canonical with different metadata → overwritten via `upsert`;
//! 3. the slots between the boundary and the checkpoint are fetched again,
//!    and canonical router transactions with no record yet are written
//!    (or quarantined). This picks up blocks that replaced already
//!    checkpointed ones.
//!
//! A failed resolution leaves the record as it is until the next cycle.
//! An orphan only removes the row if its provisional slot is still the one
//! that was resolved, so a concurrent re-observation wins.
//! The reconciler never moves the checkpoint.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::classifier::Classifier;
use crate::error::HistoryError;
use crate::fetcher::normalize;
use crate::source::ChainSource;
use crate::types::{CanonicalStatus, HistoryEntry, ProvisionalEntry, QuarantineEntry, RecordState, Slot};
use crate::writer::{BatchCommit, HistoryStore, UpsertOutcome};

/// Summary of one reconcile cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub head: Slot,
    /// Highest final slot for this cycle.
    pub boundary: Slot,
    pub finalized: u64,
    pub checked: u64,
    pub unchanged: u64,
    pub overwritten: u64,
    pub orphaned: u64,
    /// Entries left in their last-known state because resolution failed.
    pub unresolved: u64,
    /// Canonical transactions in the window that had no record yet.
    pub recovered: u64,
    /// Transactions in the window rejected by the classifier.
    pub quarantined: u64,
}

pub struct Reconciler<S: ?Sized, H: ?Sized> {
    source: Arc<S>,
    store: Arc<H>,
    classifier: Classifier,
    finality_depth: u64,
    concurrency: usize,
    /// Pipeline whose checkpoint bounds the rescan, with its genesis slot.
    rescan: Option<(String, Slot)>,
}

impl<S, H> Reconciler<S, H>
where
    S: ChainSource + ?Sized,
    H: HistoryStore + ?Sized,
{
    pub fn new(
        source: Arc<S>,
        store: Arc<H>,
        classifier: Classifier,
        finality_depth: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            classifier,
            finality_depth,
            concurrency: concurrency.max(1),
            rescan: None,
        }
    }

    /// Also rescan `boundary+1 ..= checkpoint` of `pipeline_id` each cycle.
    pub fn with_rescan(mut self, pipeline_id: impl Into<String>, genesis: Slot) -> Self {
        self.rescan = Some((pipeline_id.into(), genesis));
        self
    }

    pub fn finality_depth(&self) -> u64 {
        self.finality_depth
    }

    /// Run one reconcile cycle.
    ///
    /// Fails only if the head cannot be read or the store rejects a write;
    /// both leave the store consistent and the next cycle starts over.
    pub async fn run_cycle(&self) -> Result<ReconcileReport, HistoryError> {
        let head = self.source.head_slot().await?;
        let boundary = head.saturating_sub(self.finality_depth);

        let mut report = ReconcileReport {
            head,
            boundary,
            ..Default::default()
        };

        report.finalized = self.store.finalize_through(boundary).await?;

        let pending = self.store.provisional_after(boundary).await?;
        report.checked = pending.len() as u64;

        let source = &self.source;
        let resolved: Vec<_> = stream::iter(pending)
            .map(|entry| async move {
                let status = source.resolve(&entry.signature).await;
                (entry, status)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (entry, status) in resolved {
            match status {
                Ok(status) => self.apply(&entry, status, &mut report).await?,
                Err(e) => {
                    debug!(signature = %entry.signature, error = %e, "resolution failed, retrying next cycle");
                    report.unresolved += 1;
                }
            }
        }

        if let Some((pipeline_id, genesis)) = &self.rescan {
            self.rescan_window(pipeline_id, *genesis, boundary, &mut report).await?;
        }

        info!(
            head,
            boundary,
            finalized = report.finalized,
            checked = report.checked,
            orphaned = report.orphaned,
            overwritten = report.overwritten,
            unresolved = report.unresolved,
            recovered = report.recovered,
            "reconcile cycle complete"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        entry: &ProvisionalEntry,
        status: CanonicalStatus,
        report: &mut ReconcileReport,
    ) -> Result<(), HistoryError> {
        let raw = match status {
            CanonicalStatus::Absent => {
                if self.store.orphan(&entry.signature, entry.slot).await? {
                    warn!(signature = %entry.signature, slot = entry.slot, "record orphaned by reorg");
                    report.orphaned += 1;
                } else {
                    debug!(signature = %entry.signature, slot = entry.slot, "re-observed since resolution, keeping");
                }
                return Ok(());
            }
            CanonicalStatus::Canonical(raw) => raw,
        };

        let record = match self.classifier.classify(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(signature = %entry.signature, error = %e, "re-included transaction no longer classifies");
                report.unresolved += 1;
                return Ok(());
            }
        };

        let existing = self.store.get(&entry.signature).await?;
        match UpsertOutcome::decide(existing.as_ref(), &record) {
            UpsertOutcome::Unchanged => {
                if raw.slot != entry.slot {
                    self.store.set_provisional_slot(&entry.signature, raw.slot).await?;
                }
                report.unchanged += 1;
            }
            _ => {
                warn!(
                    signature = %entry.signature,
                    old_slot = entry.slot,
                    new_slot = raw.slot,
                    "re-included with different metadata, overwriting"
                );
                self.store.upsert(&HistoryEntry::new(record, raw.slot)).await?;
                report.overwritten += 1;
            }
        }
        Ok(())
    }

    async fn rescan_window(
        &self,
        pipeline_id: &str,
        genesis: Slot,
        boundary: Slot,
        report: &mut ReconcileReport,
    ) -> Result<(), HistoryError> {
        let Some(checkpoint) = self.store.load(pipeline_id).await? else {
            return Ok(());
        };
        let start = boundary.max(genesis) + 1;
        let end = checkpoint.slot;
        if start > end {
            return Ok(());
        }

        let program_ids = &self.classifier.config().router_program_ids;
        let raw = match self.source.fetch_slots(start, end, program_ids).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(start, end, error = %e, "window rescan failed, retrying next cycle");
                return Ok(());
            }
        };

        let known: HashSet<_> = self
            .store
            .quarantined()
            .await?
            .into_iter()
            .map(|q| q.signature)
            .collect();

        let mut commit = BatchCommit::default();
        for tx in normalize(start, end, raw).iter().flat_map(|s| s.transactions.iter()) {
            if !tx.invokes_any(program_ids) || known.contains(&tx.signature) {
                continue;
            }
            if self.store.state(&tx.signature).await? != RecordState::Unseen {
                continue;
            }
            match self.classifier.classify(tx) {
                Ok(record) => {
                    warn!(signature = %tx.signature, slot = tx.slot, "canonical transaction missing from history, recording");
                    commit.entries.push(HistoryEntry::new(record, tx.slot));
                }
                Err(e) if e.is_quarantinable() => {
                    warn!(signature = %tx.signature, slot = tx.slot, error = %e, "quarantining transaction");
                    commit.quarantined.push(QuarantineEntry {
                        signature: tx.signature.clone(),
                        slot: tx.slot,
                        reason: e.to_string(),
                        detected_at: chrono::Utc::now().timestamp(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if commit.entries.is_empty() && commit.quarantined.is_empty() {
            return Ok(());
        }
        let result = self.store.commit_batch(&commit).await?;
        report.recovered += result.summary.inserted;
        report.quarantined += commit.quarantined.len() as u64;
        Ok(())
    }
}
