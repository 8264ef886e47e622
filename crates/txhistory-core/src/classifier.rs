//! Transaction classifier: derives outcome and router version from a raw
//! transaction.
//!
//! Classification is a pure function of the raw transaction and the
//! `ClassifierConfig`: the same input always yields the same record.
//!
//! The router version is read from a marker byte inside the data of the first
//! instruction that invokes a configured router program. Top-level
//! instructions are searched before inner (CPI) instructions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::types::{RawInstruction, RawTransaction, RouterVersion, TransactionRecord};

/// Classifier settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Base58 program ids of every router deployment to track.
    pub router_program_ids: Vec<String>,
    /// Byte offset of the version marker inside the router instruction data.
    pub version_marker_offset: usize,
    /// Router versions that are recognised; anything else is rejected.
    pub known_versions: Vec<RouterVersion>,
}

impl ClassifierConfig {
    pub fn new(router_program_id: impl Into<String>) -> Self {
        Self {
            router_program_ids: vec![router_program_id.into()],
            ..Default::default()
        }
    }

    pub fn known_versions(mut self, versions: impl IntoIterator<Item = RouterVersion>) -> Self {
        self.known_versions = versions.into_iter().collect();
        self
    }

    pub fn version_marker_offset(mut self, offset: usize) -> Self {
        self.version_marker_offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), HistoryError> {
        if self.router_program_ids.is_empty() {
            return Err(HistoryError::Config(
                "classifier needs at least one router program id".into(),
            ));
        }
        if self.known_versions.is_empty() {
            return Err(HistoryError::Config(
                "classifier needs at least one known router version".into(),
            ));
        }
        for id in &self.router_program_ids {
            let ok = bs58::decode(id).into_vec().map(|b| b.len() == 32).unwrap_or(false);
            if !ok {
                return Err(HistoryError::Config(format!("invalid router program id '{id}'")));
            }
        }
        Ok(())
    }
}

/// Derives `TransactionRecord`s from raw router transactions.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Returns `true` if `tx` invokes any configured router program.
    pub fn is_router_transaction(&self, tx: &RawTransaction) -> bool {
        tx.invokes_any(&self.config.router_program_ids)
    }

    /// Classify a raw transaction.
    ///
    /// Fails with `UnknownVersion` when the router marker is absent or not a
    /// known version, and with `MalformedTransaction` when the signature or
    /// block time is unusable.
    pub fn classify(&self, tx: &RawTransaction) -> Result<TransactionRecord, HistoryError> {
        if !tx.signature.is_well_formed() {
            return Err(malformed(tx, "signature is not a 64-byte base58 value"));
        }
        let block_time = tx
            .block_time
            .ok_or_else(|| malformed(tx, "missing block time"))?;
        let timestamp = DateTime::<Utc>::from_timestamp(block_time, 0)
            .ok_or_else(|| malformed(tx, &format!("block time {block_time} out of range")))?;

        let router_version = self.router_version(tx)?;

        Ok(TransactionRecord {
            signature: tx.signature.clone(),
            timestamp,
            is_success: tx.err.is_none(),
            router_version,
        })
    }

    fn router_version(&self, tx: &RawTransaction) -> Result<RouterVersion, HistoryError> {
        let ix = self
            .router_instruction(tx)
            .ok_or_else(|| unknown(tx, "no router instruction"))?;

        let data = bs58::decode(&ix.data)
            .into_vec()
            .map_err(|e| unknown(tx, &format!("undecodable instruction data: {e}")))?;

        let marker = *data.get(self.config.version_marker_offset).ok_or_else(|| {
            unknown(
                tx,
                &format!(
                    "instruction data too short for marker at offset {}",
                    self.config.version_marker_offset
                ),
            )
        })?;

        let version = RouterVersion::from(marker);
        if !self.config.known_versions.contains(&version) {
            return Err(unknown(tx, &format!("unrecognised version marker {version}")));
        }
        Ok(version)
    }

    fn router_instruction<'a>(&self, tx: &'a RawTransaction) -> Option<&'a RawInstruction> {
        let is_router = |ix: &&RawInstruction| {
            self.config
                .router_program_ids
                .iter()
                .any(|p| p == &ix.program_id)
        };
        tx.instructions
            .iter()
            .find(is_router)
            .or_else(|| tx.inner_instructions.iter().find(is_router))
    }
}

fn unknown(tx: &RawTransaction, reason: &str) -> HistoryError {
    HistoryError::UnknownVersion {
        signature: tx.signature.to_string(),
        reason: reason.to_string(),
    }
}

fn malformed(tx: &RawTransaction, reason: &str) -> HistoryError {
    HistoryError::MalformedTransaction {
        signature: tx.signature.to_string(),
        reason: reason.to_string(),
    }
}
