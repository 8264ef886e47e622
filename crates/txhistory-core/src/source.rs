//! Chain-data source trait and a replayable in-process implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::types::{CanonicalStatus, RawTransaction, Signature, Slot, SlotContents};

/// Trait for reaching the chain.
///
/// Implementations wrap an RPC or streaming client; `ReplaySource` serves a
/// recorded stream from memory.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// The highest slot the source is willing to serve.
    async fn head_slot(&self) -> Result<Slot, HistoryError>;

    /// Slots in `[from, to]` with transactions that reference `program_ids`.
    ///
    /// Sources may omit slots without data and may deliver duplicates; the
    /// fetcher normalises both.
    async fn fetch_slots(
        &self,
        from: Slot,
        to: Slot,
        program_ids: &[String],
    ) -> Result<Vec<SlotContents>, HistoryError>;

    /// Re-query whether `signature` is part of the canonical chain.
    async fn resolve(&self, signature: &Signature) -> Result<CanonicalStatus, HistoryError>;
}

// ─── ReplaySource ─────────────────────────────────────────────────────────────

/// On-disk format of a recorded stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayFixture {
    /// Head slot to report; defaults to the highest recorded slot.
    #[serde(default)]
    pub head: Option<Slot>,
    pub slots: Vec<SlotContents>,
}

/// Serves a recorded stream of slots from memory.
///
/// The stream can be edited while a pipeline is running, which makes it the
/// test double for reorgs (`orphan`, `reinclude`) and outages (`fail_next`).
#[derive(Default)]
pub struct ReplaySource {
    slots: Mutex<BTreeMap<Slot, SlotContents>>,
    head: Mutex<Option<Slot>>,
    failures: AtomicU32,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: ReplayFixture) -> Self {
        let source = Self::new();
        for slot in fixture.slots {
            source.push_slot(slot);
        }
        if let Some(head) = fixture.head {
            source.set_head(head);
        }
        source
    }

    /// Load a recorded stream from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HistoryError::Config(format!("read {}: {e}", path.display())))?;
        let fixture: ReplayFixture = serde_json::from_str(&content)
            .map_err(|e| HistoryError::Config(format!("parse {}: {e}", path.display())))?;
        Ok(Self::from_fixture(fixture))
    }

    /// Add (or replace) a slot.
    pub fn push_slot(&self, contents: SlotContents) {
        self.slots_mut().insert(contents.slot, contents);
    }

    /// Pin the reported head; without a pin the highest recorded slot is used.
    pub fn set_head(&self, head: Slot) {
        *self.head.lock().unwrap_or_else(|p| p.into_inner()) = Some(head);
    }

    /// Make the next `n` calls fail with `SourceUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Remove a transaction from the canonical chain. Returns `false` if unknown.
    pub fn orphan(&self, signature: &Signature) -> bool {
        let mut slots = self.slots_mut();
        let mut found = false;
        for contents in slots.values_mut() {
            let before = contents.transactions.len();
            contents.transactions.retain(|tx| &tx.signature != signature);
            found |= contents.transactions.len() != before;
        }
        found
    }

    /// Move a transaction (possibly with changed metadata) into its `slot`.
    pub fn reinclude(&self, tx: RawTransaction) {
        self.orphan(&tx.signature);
        let mut slots = self.slots_mut();
        let contents = slots
            .entry(tx.slot)
            .or_insert_with(|| SlotContents::skipped(tx.slot));
        if contents.blockhash.is_none() {
            contents.blockhash = Some(format!("replay-{}", tx.slot));
        }
        contents.transactions.push(tx);
    }

    fn slots_mut(&self) -> std::sync::MutexGuard<'_, BTreeMap<Slot, SlotContents>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_failure(&self) -> Result<(), HistoryError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(HistoryError::SourceUnavailable("injected replay failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for ReplaySource {
    async fn head_slot(&self) -> Result<Slot, HistoryError> {
        self.check_failure()?;
        let pinned = *self.head.lock().unwrap_or_else(|p| p.into_inner());
        Ok(pinned.unwrap_or_else(|| self.slots_mut().keys().next_back().copied().unwrap_or(0)))
    }

    async fn fetch_slots(
        &self,
        from: Slot,
        to: Slot,
        program_ids: &[String],
    ) -> Result<Vec<SlotContents>, HistoryError> {
        self.check_failure()?;
        if to < from {
            return Ok(vec![]);
        }
        Ok(self
            .slots_mut()
            .range(from..=to)
            .map(|(_, contents)| {
                let mut contents = contents.clone();
                contents.transactions.retain(|tx| tx.invokes_any(program_ids));
                contents
            })
            .collect())
    }

    async fn resolve(&self, signature: &Signature) -> Result<CanonicalStatus, HistoryError> {
        self.check_failure()?;
        let slots = self.slots_mut();
        for contents in slots.values() {
            if let Some(tx) = contents.transactions.iter().find(|tx| &tx.signature == signature) {
                let mut tx = tx.clone();
                if tx.block_time.is_none() {
                    tx.block_time = contents.block_time;
                }
                return Ok(CanonicalStatus::Canonical(tx));
            }
        }
        Ok(CanonicalStatus::Absent)
    }
}
