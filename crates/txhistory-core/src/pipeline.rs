//! The pipeline driver: fetch → classify → commit → advance, with a
//! concurrent reconciler.
//!
//! # Batch step
//! Load the checkpoint, fetch the next batch of slots, classify every router
//! transaction, then commit records, quarantine rows, and the checkpoint
//! advance as one storage transaction. A crash at any point leaves either the
//! whole batch committed or none of it; re-delivery after restart is absorbed
//! by the idempotent upsert.
//!
//! # Run loop
//! Repeats the batch step until shutdown. Once caught up it polls every
//! `poll_interval_ms`. The reconciler runs as a separate task on
//! `reconcile_interval_ms`, and immediately when the fetcher sees a fork.
//! Shutdown is only observed between batches.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::classifier::Classifier;
use crate::config::{PipelineConfig, PipelineState};
use crate::error::HistoryError;
use crate::fetcher::Fetcher;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::retry::RetryPolicy;
use crate::source::ChainSource;
use crate::types::{HistoryEntry, QuarantineEntry, Slot};
use crate::writer::{BatchCommit, BatchSummary, CheckpointAdvance, HistoryStore};

/// Status emitted by the pipeline for observability.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BatchCommitted { from: Slot, to: Slot, summary: BatchSummary },
    CaughtUp { at: Slot },
    Quarantined { signature: String, slot: Slot, reason: String },
    ForkDetected { slot: Slot, depth: u64 },
    StaleCheckpoint { resumed_from: Slot },
    SourceUnhealthy { error: String },
    Reconciled(ReconcileReport),
    StateChanged(PipelineState),
}

/// Result of one batch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed { from: Slot, to: Slot, summary: BatchSummary },
    /// Nothing new at the source head.
    CaughtUp { at: Slot },
    /// Another instance advanced the checkpoint; resumed from its position.
    Stale { resumed_from: Slot },
}

/// Totals of a bounded ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub batches: u64,
    pub checkpoint: Slot,
    pub totals: BatchSummary,
}

pub struct Pipeline<S: ?Sized, H: ?Sized> {
    config: PipelineConfig,
    fetcher: Fetcher<S>,
    classifier: Classifier,
    store: Arc<H>,
    checkpoint: CheckpointManager<H>,
    retry: RetryPolicy,
    state: PipelineState,
    fork_signal: Arc<Notify>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl<S, H> Pipeline<S, H>
where
    S: ChainSource + ?Sized,
    H: HistoryStore + ?Sized,
{
    /// Create a pipeline; fails with `Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig, source: Arc<S>, store: Arc<H>) -> Result<Self, HistoryError> {
        config.validate()?;
        let classifier = Classifier::new(config.classifier.clone());
        let fetcher = Fetcher::new(
            source,
            config.classifier.router_program_ids.clone(),
            config.tracker_window,
        );
        let checkpoint = CheckpointManager::new(store.clone(), &config.id, config.genesis_slot);
        Ok(Self {
            retry: RetryPolicy::new(config.retry.clone()),
            fetcher,
            classifier,
            store,
            checkpoint,
            state: PipelineState::Idle,
            fork_signal: Arc::new(Notify::new()),
            events: None,
            config,
        })
    }

    /// Deliver `PipelineEvent`s to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current durable checkpoint (creating it at genesis on first start).
    pub async fn checkpoint(&mut self) -> Result<Slot, HistoryError> {
        self.checkpoint.load().await
    }

    /// A reconciler sharing this pipeline's source, store, and classifier.
    pub fn reconciler(&self) -> Reconciler<S, H> {
        Reconciler::new(
            self.fetcher.source().clone(),
            self.store.clone(),
            self.classifier.clone(),
            self.config.finality_depth,
            self.config.resolve_concurrency,
        )
        .with_rescan(self.config.id.clone(), self.config.genesis_slot)
    }

    /// Process one batch.
    pub async fn run_once(&mut self) -> Result<BatchOutcome, HistoryError> {
        let from = self.checkpoint.load().await?;

        let fetcher = &self.fetcher;
        let batch_size = self.config.batch_size;
        let batch = self
            .retry
            .run("fetch_batch", move || fetcher.fetch_batch(from, batch_size))
            .await?;

        for fork in &batch.forks {
            self.emit(PipelineEvent::ForkDetected { slot: fork.detected_at, depth: fork.depth });
        }
        if batch.fork_detected() {
            self.fork_signal.notify_one();
        }

        if batch.is_caught_up() {
            self.emit(PipelineEvent::CaughtUp { at: from });
            return Ok(BatchOutcome::CaughtUp { at: from });
        }

        let mut entries = Vec::with_capacity(batch.transaction_count());
        let mut quarantined = Vec::new();
        for tx in batch.transactions() {
            match self.classifier.classify(tx) {
                Ok(record) => entries.push(HistoryEntry::new(record, tx.slot)),
                Err(e) if e.is_quarantinable() => {
                    warn!(signature = %tx.signature, slot = tx.slot, error = %e, "quarantining transaction");
                    self.emit(PipelineEvent::Quarantined {
                        signature: tx.signature.to_string(),
                        slot: tx.slot,
                        reason: e.to_string(),
                    });
                    quarantined.push(QuarantineEntry {
                        signature: tx.signature.clone(),
                        slot: tx.slot,
                        reason: e.to_string(),
                        detected_at: chrono::Utc::now().timestamp(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let commit = BatchCommit {
            entries,
            quarantined,
            checkpoint: Some(CheckpointAdvance {
                pipeline_id: self.config.id.clone(),
                expected: from,
                to: batch.next,
            }),
        };

        let store = &self.store;
        let commit_ref = &commit;
        let result = self
            .retry
            .run("commit_batch", move || store.commit_batch(commit_ref))
            .await;

        match result {
            Ok(committed) => {
                if let Some(cp) = &committed.checkpoint {
                    self.checkpoint.committed(cp);
                }
                let mut summary = committed.summary;
                summary.quarantined = commit.quarantined.len() as u64;
                info!(
                    from,
                    to = batch.next,
                    inserted = summary.inserted,
                    unchanged = summary.unchanged,
                    overwritten = summary.overwritten,
                    quarantined = summary.quarantined,
                    "batch committed"
                );
                self.emit(PipelineEvent::BatchCommitted {
                    from,
                    to: batch.next,
                    summary: summary.clone(),
                });
                Ok(BatchOutcome::Committed { from, to: batch.next, summary })
            }
            Err(e) if e.is_stale_checkpoint() => {
                self.checkpoint.invalidate();
                let resumed_from = self.checkpoint.reload().await?;
                warn!(from, resumed_from, error = %e, "checkpoint moved underneath us, resuming");
                self.emit(PipelineEvent::StaleCheckpoint { resumed_from });
                Ok(BatchOutcome::Stale { resumed_from })
            }
            Err(e) => Err(e),
        }
    }

    /// Process batches until the source head is reached.
    pub async fn run_until_caught_up(&mut self) -> Result<IngestReport, HistoryError> {
        let mut report = IngestReport::default();
        loop {
            match self.run_once().await? {
                BatchOutcome::Committed { to, summary, .. } => {
                    report.batches += 1;
                    report.checkpoint = to;
                    report.totals.inserted += summary.inserted;
                    report.totals.unchanged += summary.unchanged;
                    report.totals.overwritten += summary.overwritten;
                    report.totals.quarantined += summary.quarantined;
                }
                BatchOutcome::CaughtUp { at } => {
                    report.checkpoint = at;
                    return Ok(report);
                }
                BatchOutcome::Stale { resumed_from } => report.checkpoint = resumed_from,
            }
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "pipeline state change");
            self.state = state;
            self.emit(PipelineEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl<S, H> Pipeline<S, H>
where
    S: ChainSource + ?Sized + 'static,
    H: HistoryStore + ?Sized + 'static,
{
    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Source outages past the retry cap pause the pipeline as `Unhealthy`;
    /// any other error stops it and is returned.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<Checkpoint, HistoryError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let reconcile_task = tokio::spawn(reconcile_loop(
            self.reconciler(),
            self.config.reconcile_interval(),
            self.fork_signal.clone(),
            stop_rx,
            self.events.clone(),
        ));

        let result = self.drive(&mut shutdown).await;

        let _ = stop_tx.send(true);
        if let Err(e) = reconcile_task.await {
            error!(error = %e, "reconciler task panicked");
        }

        match result {
            Ok(()) => {
                self.set_state(PipelineState::Stopped);
                let pipeline_id = self.config.id.clone();
                self.store
                    .load(&pipeline_id)
                    .await?
                    .ok_or_else(|| HistoryError::Storage(format!("checkpoint '{pipeline_id}' missing")))
            }
            Err(e) => {
                self.set_state(PipelineState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), HistoryError> {
        let start = self.checkpoint.load().await?;
        info!(pipeline = %self.config.id, checkpoint = start, "pipeline starting");
        self.set_state(PipelineState::CatchingUp);

        loop {
            if *shutdown.borrow() {
                self.set_state(PipelineState::Stopping);
                return Ok(());
            }

            let pause = match self.run_once().await {
                Ok(BatchOutcome::Committed { .. }) | Ok(BatchOutcome::Stale { .. }) => {
                    self.set_state(PipelineState::CatchingUp);
                    None
                }
                Ok(BatchOutcome::CaughtUp { .. }) => {
                    self.set_state(PipelineState::Live);
                    Some(self.config.poll_interval())
                }
                Err(e) if e.is_source_failure() => {
                    error!(error = %e, "source unavailable past retry cap, pausing");
                    self.set_state(PipelineState::Unhealthy);
                    self.emit(PipelineEvent::SourceUnhealthy { error: e.to_string() });
                    Some(self.config.unhealthy_pause())
                }
                Err(e) => {
                    error!(error = %e, "pipeline failed");
                    return Err(e);
                }
            };

            if let Some(delay) = pause {
                if wait_or_shutdown(delay, shutdown).await {
                    self.set_state(PipelineState::Stopping);
                    return Ok(());
                }
            }
        }
    }
}

/// Sleep for `delay`; returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn reconcile_loop<S, H>(
    reconciler: Reconciler<S, H>,
    interval: Duration,
    fork_signal: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
) where
    S: ChainSource + ?Sized,
    H: HistoryStore + ?Sized,
{
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = fork_signal.notified() => {
                info!("fork signal received, reconciling now");
            }
            _ = stop.changed() => return,
        }
        if *stop.borrow() {
            return;
        }

        match reconciler.run_cycle().await {
            Ok(report) => {
                if let Some(tx) = &events {
                    let _ = tx.send(PipelineEvent::Reconciled(report));
                }
            }
            Err(e) => warn!(error = %e, "reconcile cycle failed, retrying next interval"),
        }
    }
}
