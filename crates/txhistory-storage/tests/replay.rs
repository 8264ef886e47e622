//! Recorded-stream test: replays `fixtures/replay.json` with the settings in
//! `fixtures/pipeline.json`.

use std::path::PathBuf;
use std::sync::Arc;

use txhistory_core::{CheckpointStore, HistoryStore, Pipeline, PipelineConfig, ReplaySource, Signature};
use txhistory_storage::InMemoryStorage;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

fn sig(n: u8) -> Signature {
    Signature::from_bytes(&[n; 64])
}

#[tokio::test]
async fn recorded_stream_produces_expected_history() {
    let config = PipelineConfig::from_json_file(fixture("pipeline.json")).unwrap();
    let source = Arc::new(ReplaySource::from_json_file(fixture("replay.json")).unwrap());
    let store = Arc::new(InMemoryStorage::new());

    let mut pipeline = Pipeline::new(config, source, store.clone()).unwrap();
    let report = pipeline.run_until_caught_up().await.unwrap();

    assert_eq!(report.checkpoint, 250_000_006);
    assert_eq!(report.batches, 3);
    assert_eq!(store.count().await.unwrap(), 4);
    assert_eq!(store.load("router-replay").await.unwrap().unwrap().revision, 3);

    let s1 = store.get(&sig(0x11)).await.unwrap().unwrap();
    assert!(s1.is_success);
    assert_eq!(s1.router_version, 3);
    assert_eq!(s1.timestamp.timestamp(), 1_700_000_001);

    let s2 = store.get(&sig(0x22)).await.unwrap().unwrap();
    assert!(!s2.is_success);
    assert_eq!(s2.router_version, 3);

    // router reached only through an inner instruction
    let s3 = store.get(&sig(0x33)).await.unwrap().unwrap();
    assert_eq!(s3.router_version, 2);

    // transaction-level block time wins over the slot's
    let s6 = store.get(&sig(0x66)).await.unwrap().unwrap();
    assert_eq!(s6.router_version, 1);
    assert_eq!(s6.timestamp.timestamp(), 1_700_000_005);

    let quarantined = store.quarantined().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].signature, sig(0x44));
    assert_eq!(quarantined[0].slot, 250_000_004);

    // not a router transaction at all
    assert!(store.get(&sig(0x55)).await.unwrap().is_none());
}
