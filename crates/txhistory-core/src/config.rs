//! Pipeline configuration, runtime state, and the fluent builder.
//!
//! # Example
//!
//! ```rust
//! use txhistory_core::config::PipelineBuilder;
//! use txhistory_core::classifier::ClassifierConfig;
//!
//! let config = PipelineBuilder::new()
//!     .id("router-mainnet")
//!     .genesis_slot(250_000_000)
//!     .batch_size(200)
//!     .finality_depth(32)
//!     .classifier(
//!         ClassifierConfig::new("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4").known_versions([1, 2, 3]),
//!     )
//!     .build_config();
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierConfig;
use crate::error::HistoryError;
use crate::retry::RetryConfig;
use crate::types::Slot;

/// Configuration for a pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Unique name for this pipeline (used as the checkpoint key).
    pub id: String,
    /// Checkpoint value on first start; ingestion begins at `genesis_slot + 1`.
    pub genesis_slot: Slot,
    /// Maximum number of slots per fetched batch.
    pub batch_size: u64,
    /// Sleep between polls once caught up with the head (milliseconds).
    pub poll_interval_ms: u64,
    /// Number of slots below the head within which reorgs are still possible.
    pub finality_depth: u64,
    /// Interval between reconcile cycles (milliseconds).
    pub reconcile_interval_ms: u64,
    /// Maximum concurrent signature resolutions per reconcile cycle.
    pub resolve_concurrency: usize,
    /// Number of recent blocks kept for parent-hash checks.
    pub tracker_window: usize,
    /// Pause after the source stayed unavailable past the retry cap (milliseconds).
    pub unhealthy_pause_ms: u64,
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            genesis_slot: 0,
            batch_size: 100,
            poll_interval_ms: 400,
            finality_depth: 32,
            reconcile_interval_ms: 10_000,
            resolve_concurrency: 8,
            tracker_window: 256,
            unhealthy_pause_ms: 30_000,
            retry: RetryConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HistoryError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| HistoryError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.id.trim().is_empty() {
            return Err(HistoryError::Config("pipeline id must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(HistoryError::Config("batch_size must be at least 1".into()));
        }
        if self.resolve_concurrency == 0 {
            return Err(HistoryError::Config("resolve_concurrency must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(HistoryError::Config("retry.multiplier must be >= 1.0".into()));
        }
        self.classifier.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn unhealthy_pause(&self) -> Duration {
        Duration::from_millis(self.unhealthy_pause_ms)
    }
}

/// Runtime state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    /// Not yet started.
    Idle,
    /// Behind the source head, fetching full batches.
    CatchingUp,
    /// At the source head, polling.
    Live,
    /// Source unreachable past the retry cap; paused.
    Unhealthy,
    /// Shutting down gracefully.
    Stopping,
    Stopped,
    /// Encountered an unrecoverable error.
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Fluent builder for `PipelineConfig`.
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pipeline ID (used as the checkpoint key).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn genesis_slot(mut self, slot: Slot) -> Self {
        self.config.genesis_slot = slot;
        self
    }

    /// Set the number of slots per batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    pub fn reconcile_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconcile_interval_ms = ms;
        self
    }

    pub fn resolve_concurrency(mut self, n: usize) -> Self {
        self.config.resolve_concurrency = n;
        self
    }

    pub fn tracker_window(mut self, n: usize) -> Self {
        self.config.tracker_window = n;
        self
    }

    pub fn unhealthy_pause_ms(mut self, ms: u64) -> Self {
        self.config.unhealthy_pause_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.config.classifier = classifier;
        self
    }

    /// Build the `PipelineConfig`.
    pub fn build_config(self) -> PipelineConfig {
        self.config
    }
}
