//! Checkpoint store: the durable cursor of the pipeline.
//!
//! A checkpoint records the last slot whose records are durably committed.
//! It only moves forward, and only through compare-and-advance: a writer must
//! name the slot it believes is stored, so a second pipeline instance working
//! from an out-of-date view fails with `StaleCheckpoint` instead of racing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::types::Slot;

/// A persisted checkpoint for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique pipeline identifier.
    pub pipeline_id: String,
    /// Last fully processed slot.
    pub slot: Slot,
    /// Incremented by one on every successful advance.
    pub revision: u64,
    /// Unix timestamp of the last write.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn genesis(pipeline_id: impl Into<String>, slot: Slot) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            slot,
            revision: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Apply a compare-and-advance against this stored value.
    ///
    /// Fails unless `expected` equals the stored slot and `to` is strictly greater.
    pub fn advanced(&self, expected: Slot, to: Slot) -> Result<Checkpoint, HistoryError> {
        if self.slot != expected || to <= self.slot {
            return Err(HistoryError::StaleCheckpoint {
                stored: self.slot,
                attempted: to,
            });
        }
        Ok(Checkpoint {
            pipeline_id: self.pipeline_id.clone(),
            slot: to,
            revision: self.revision + 1,
            updated_at: chrono::Utc::now().timestamp(),
        })
    }
}

/// Trait for storing and advancing checkpoints.
///
/// Implementations include `MemoryCheckpointStore` and the storage backends in
/// `txhistory-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a pipeline, if one was ever created.
    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, HistoryError>;

    /// Create the checkpoint at `genesis` unless one exists; returns the stored value.
    async fn initialize(&self, pipeline_id: &str, genesis: Slot) -> Result<Checkpoint, HistoryError>;

    /// Compare-and-advance from `expected` to `to`.
    async fn advance(
        &self,
        pipeline_id: &str,
        expected: Slot,
        to: Slot,
    ) -> Result<Checkpoint, HistoryError>;
}

/// Caches a pipeline's view of its checkpoint and guards every advance.
pub struct CheckpointManager<C: ?Sized> {
    store: Arc<C>,
    pipeline_id: String,
    genesis: Slot,
    current: Option<Slot>,
}

impl<C: CheckpointStore + ?Sized> CheckpointManager<C> {
    pub fn new(store: Arc<C>, pipeline_id: impl Into<String>, genesis: Slot) -> Self {
        Self {
            store,
            pipeline_id: pipeline_id.into(),
            genesis,
            current: None,
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// The last slot this manager knows to be durably committed.
    pub fn current(&self) -> Option<Slot> {
        self.current
    }

    /// Returns the last durably committed slot, creating the checkpoint at the
    /// genesis slot on first start.
    pub async fn load(&mut self) -> Result<Slot, HistoryError> {
        if let Some(slot) = self.current {
            return Ok(slot);
        }
        self.reload().await
    }

    /// Discard the cached value and re-read the authoritative checkpoint.
    pub async fn reload(&mut self) -> Result<Slot, HistoryError> {
        let cp = self.store.initialize(&self.pipeline_id, self.genesis).await?;
        self.current = Some(cp.slot);
        Ok(cp.slot)
    }

    /// Durably advance to `to`.
    ///
    /// On `StaleCheckpoint` the cached value is dropped so the next `load`
    /// re-reads the stored position; the same advance is never retried.
    pub async fn advance(&mut self, to: Slot) -> Result<Checkpoint, HistoryError> {
        let expected = self.load().await?;
        match self.store.advance(&self.pipeline_id, expected, to).await {
            Ok(cp) => {
                self.current = Some(cp.slot);
                Ok(cp)
            }
            Err(e) => {
                if e.is_stale_checkpoint() {
                    self.current = None;
                }
                Err(e)
            }
        }
    }

    /// Record an advance that was committed through another path (e.g. a
    /// combined batch commit).
    pub fn committed(&mut self, cp: &Checkpoint) {
        self.current = Some(cp.slot);
    }

    /// Forget the cached value after a stale commit.
    pub fn invalidate(&mut self) {
        self.current = None;
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral pipelines.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Checkpoint>>, HistoryError> {
        self.data
            .lock()
            .map_err(|_| HistoryError::Storage("checkpoint store poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, pipeline_id: &str) -> Result<Option<Checkpoint>, HistoryError> {
        Ok(self.lock()?.get(pipeline_id).cloned())
    }

    async fn initialize(&self, pipeline_id: &str, genesis: Slot) -> Result<Checkpoint, HistoryError> {
        Ok(self
            .lock()?
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
        let mut data = self.lock()?;
        let stored = data.get(pipeline_id).ok_or_else(|| {
            HistoryError::Storage(format!("checkpoint for '{pipeline_id}' not initialized"))
        })?;
        let next = stored.advanced(expected, to)?;
        data.insert(pipeline_id.to_string(), next.clone());
        Ok(next)
    }
}
