#![allow(dead_code)]

use txhistory_core::{
    ClassifierConfig, PipelineBuilder, PipelineConfig, RawInstruction, RawTransaction, RetryConfig,
    Signature, Slot, SlotContents,
};

pub const ROUTER: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
pub const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";

pub fn sig(n: u8) -> Signature {
    Signature::from_bytes(&[n; 64])
}

pub fn router_ix(version: u8) -> RawInstruction {
    RawInstruction {
        program_id: ROUTER.into(),
        data: bs58::encode([version, 0xe5, 0x17, 0xcb, 0x97]).into_string(),
    }
}

pub fn router_tx(signature: &Signature, slot: Slot, version: u8, success: bool) -> RawTransaction {
    RawTransaction {
        signature: signature.clone(),
        slot,
        block_time: None,
        err: if success {
            None
        } else {
            Some(serde_json::json!({ "InstructionError": [0, { "Custom": 6001 }] }))
        },
        instructions: vec![router_ix(version)],
        inner_instructions: vec![],
    }
}

pub fn block(slot: Slot, parent: Slot, transactions: Vec<RawTransaction>) -> SlotContents {
    SlotContents {
        slot,
        blockhash: Some(format!("hash-{slot}")),
        parent_blockhash: Some(format!("hash-{parent}")),
        block_time: Some(1_700_000_000 + slot as i64),
        transactions,
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
        multiplier: 2.0,
    }
}

pub fn config(id: &str) -> PipelineConfig {
    PipelineBuilder::new()
        .id(id)
        .batch_size(4)
        .finality_depth(5)
        .poll_interval_ms(5)
        .reconcile_interval_ms(60_000)
        .unhealthy_pause_ms(10)
        .retry(fast_retry())
        .classifier(ClassifierConfig::new(ROUTER).known_versions([1, 2, 3]))
        .build_config()
}
