//! Shared types for the ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chain position. Slots increase monotonically; some are skipped (no block).
pub type Slot = u64;

/// Integer tag identifying which deployed build of the router executed a transaction.
pub type RouterVersion = u16;

// ─── Signature ───────────────────────────────────────────────────────────────

/// Length in bytes of a decoded ed25519 transaction signature.
pub const SIGNATURE_LEN: usize = 64;

/// Base58-encoded transaction signature; the identity key of a history row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Encode raw signature bytes as base58.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Self(bs58::encode(bytes).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the value decodes to exactly 64 bytes of base58.
    pub fn is_well_formed(&self) -> bool {
        bs58::decode(&self.0)
            .into_vec()
            .map(|b| b.len() == SIGNATURE_LEN)
            .unwrap_or(false)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Signature {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─── Raw chain data ──────────────────────────────────────────────────────────

/// A single compiled instruction as delivered by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstruction {
    /// Base58 program id invoked by the instruction.
    pub program_id: String,
    /// Base58-encoded instruction data.
    #[serde(default)]
    pub data: String,
}

/// A transaction referencing the router program, as fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub signature: Signature,
    pub slot: Slot,
    /// Unix timestamp (seconds) of the including block, if the source reports one.
    #[serde(default)]
    pub block_time: Option<i64>,
    /// The chain's execution verdict: `None` means the transaction succeeded.
    #[serde(default)]
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub instructions: Vec<RawInstruction>,
    /// Instructions invoked through CPI, flattened in execution order.
    #[serde(default)]
    pub inner_instructions: Vec<RawInstruction>,
}

impl RawTransaction {
    /// Returns `true` if any top-level or inner instruction invokes one of `program_ids`.
    pub fn invokes_any(&self, program_ids: &[String]) -> bool {
        self.instructions
            .iter()
            .chain(self.inner_instructions.iter())
            .any(|ix| program_ids.iter().any(|p| p == &ix.program_id))
    }
}

/// Everything the source knows about one slot in a fetched range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotContents {
    pub slot: Slot,
    /// Hash of the block produced in this slot; `None` for a skipped slot.
    #[serde(default)]
    pub blockhash: Option<String>,
    /// Hash of the parent block; `None` for a skipped slot.
    #[serde(default)]
    pub parent_blockhash: Option<String>,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub transactions: Vec<RawTransaction>,
}

impl SlotContents {
    /// A slot with no produced block.
    pub fn skipped(slot: Slot) -> Self {
        Self {
            slot,
            blockhash: None,
            parent_blockhash: None,
            block_time: None,
            transactions: vec![],
        }
    }

    /// Returns `true` if no block was produced in this slot.
    pub fn is_skipped(&self) -> bool {
        self.blockhash.is_none()
    }
}

/// The canonical-chain verdict for a previously seen signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalStatus {
    /// The transaction is included in the canonical chain (possibly re-included
    /// at a different slot).
    Canonical(RawTransaction),
    /// The transaction is no longer part of the canonical chain.
    Absent,
}

// ─── History rows ────────────────────────────────────────────────────────────

/// One row of `tx_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: Signature,
    pub timestamp: DateTime<Utc>,
    pub is_success: bool,
    pub router_version: RouterVersion,
}

/// A record together with the slot it was observed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub record: TransactionRecord,
    pub slot: Slot,
}

impl HistoryEntry {
    pub fn new(record: TransactionRecord, slot: Slot) -> Self {
        Self { record, slot }
    }

    pub fn signature(&self) -> &Signature {
        &self.record.signature
    }
}

/// A record still inside the finality window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionalEntry {
    pub signature: Signature,
    pub slot: Slot,
}

/// A transaction the classifier rejected, kept for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub signature: Signature,
    pub slot: Slot,
    pub reason: String,
    /// Unix timestamp (seconds) when the transaction was quarantined.
    pub detected_at: i64,
}

/// Lifecycle of a single signature in the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Unseen,
    /// Recorded and still within the finality window.
    Provisional,
    /// Past the finality boundary; never touched again.
    Final,
    /// Removed by the reconciler.
    Orphaned,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unseen => write!(f, "unseen"),
            Self::Provisional => write!(f, "provisional"),
            Self::Final => write!(f, "final"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
