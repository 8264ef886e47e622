//! Error types for the transaction-history pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting or reconciling router transactions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The chain-data source could not be reached (transient).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The router version marker is missing or not a known version.
    #[error("unknown router version for {signature}: {reason}")]
    UnknownVersion { signature: String, reason: String },

    /// The raw transaction cannot be turned into a record.
    #[error("malformed transaction {signature}: {reason}")]
    MalformedTransaction { signature: String, reason: String },

    /// A checkpoint advance was attempted against an out-of-date position.
    #[error("stale checkpoint: stored slot is {stored}, attempted advance to {attempted}")]
    StaleCheckpoint { stored: u64, attempted: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A transient operation kept failing past the retry cap.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<HistoryError>,
    },

    #[error("{0}")]
    Other(String),
}

impl HistoryError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_) | Self::Storage(_))
    }

    /// Returns `true` if the error concerns a single transaction that should be
    /// quarantined rather than halting the batch.
    pub fn is_quarantinable(&self) -> bool {
        matches!(
            self,
            Self::UnknownVersion { .. } | Self::MalformedTransaction { .. }
        )
    }

    /// Returns `true` for a checkpoint compare-and-advance conflict.
    pub fn is_stale_checkpoint(&self) -> bool {
        matches!(self, Self::StaleCheckpoint { .. })
    }

    /// Returns `true` if the underlying cause is the chain-data source.
    pub fn is_source_failure(&self) -> bool {
        match self {
            Self::SourceUnavailable(_) => true,
            Self::RetryExhausted { last, .. } => last.is_source_failure(),
            _ => false,
        }
    }
}
