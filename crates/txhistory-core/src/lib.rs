//! txhistory-core: foundation for the router transaction-history pipeline.
//!
//! # Architecture
//!
//! ```text
//! PipelineBuilder → Pipeline
//!                      ├── Fetcher          (gap-free slot batches, SlotTracker fork checks)
//!                      ├── Classifier       (router version marker, success flag)
//!                      ├── CheckpointManager (compare-and-advance resume point)
//!                      ├── HistoryStore     (idempotent upserts, atomic batch commit)
//!                      └── Reconciler       (provisional → final / orphaned, own task)
//! ```
//!
//! Sources implement [`ChainSource`]; storage backends (memory / SQLite /
//! Postgres) live in `txhistory-storage` and implement [`HistoryStore`].

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod reconciler;
pub mod retry;
pub mod source;
pub mod tracker;
pub mod types;
pub mod writer;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use classifier::{Classifier, ClassifierConfig};
pub use config::{PipelineBuilder, PipelineConfig, PipelineState};
pub use error::HistoryError;
pub use fetcher::{FetchedBatch, Fetcher};
pub use pipeline::{BatchOutcome, IngestReport, Pipeline, PipelineEvent};
pub use reconciler::{ReconcileReport, Reconciler};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{ChainSource, ReplayFixture, ReplaySource};
pub use tracker::{ForkSignal, SlotTracker};
pub use types::{
    CanonicalStatus, HistoryEntry, ProvisionalEntry, QuarantineEntry, RawInstruction,
    RawTransaction, RecordState, RouterVersion, Signature, Slot, SlotContents, TransactionRecord,
};
pub use writer::{BatchCommit, BatchSummary, CheckpointAdvance, CommitResult, HistoryStore, UpsertOutcome};
