//! The long-running pipeline: polling, fork-triggered reconciliation,
//! unhealthy pauses, and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::sync::{mpsc, watch};
use txhistory_core::{HistoryStore, Pipeline, PipelineEvent, PipelineState, ReplaySource, SlotContents};
use txhistory_storage::InMemoryStorage;

/// Wait until `pred` matches an event, failing the test after a few seconds.
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>, mut pred: F) -> PipelineEvent
where
    F: FnMut(&PipelineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for pipeline event")
}

#[tokio::test]
async fn fork_triggers_reconcile_and_shutdown_is_clean() {
    let source = Arc::new(ReplaySource::new());
    source.push_slot(block(1, 0, vec![router_tx(&sig(1), 1, 3, true)]));
    source.push_slot(block(2, 1, vec![router_tx(&sig(2), 2, 3, true)]));

    let store = Arc::new(InMemoryStorage::new());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline = Pipeline::new(config("router"), source.clone(), store.clone())
        .unwrap()
        .with_events(events_tx);
    let handle = tokio::spawn(pipeline.run(shutdown_rx));

    wait_for(&mut events, |e| matches!(e, PipelineEvent::CaughtUp { at: 2 })).await;
    assert_eq!(store.count().await.unwrap(), 2);

    // slot 2 is replaced: its transaction is gone and slot 3 builds on slot 1
    source.orphan(&sig(2));
    source.push_slot(SlotContents {
        parent_blockhash: Some("hash-1".into()),
        ..block(3, 2, vec![])
    });

    wait_for(&mut events, |e| matches!(e, PipelineEvent::ForkDetected { slot: 3, .. })).await;
    let event = wait_for(&mut events, |e| matches!(e, PipelineEvent::Reconciled(_))).await;
    if let PipelineEvent::Reconciled(report) = event {
        assert_eq!(report.orphaned, 1);
    }
    assert!(store.get(&sig(2)).await.unwrap().is_none());
    assert!(store.get(&sig(1)).await.unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    let checkpoint = handle.await.unwrap().unwrap();
    assert_eq!(checkpoint.slot, 3);
    wait_for(&mut events, |e| matches!(e, PipelineEvent::StateChanged(PipelineState::Stopped))).await;
}

#[tokio::test]
async fn source_outage_pauses_instead_of_failing() {
    let source = Arc::new(ReplaySource::new());
    source.push_slot(block(1, 0, vec![router_tx(&sig(1), 1, 2, true)]));

    let store = Arc::new(InMemoryStorage::new());
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // two full retry rounds fail, the third succeeds
    source.fail_next(8);
    let pipeline = Pipeline::new(config("router"), source.clone(), store.clone())
        .unwrap()
        .with_events(events_tx);
    let handle = tokio::spawn(pipeline.run(shutdown_rx));

    wait_for(&mut events, |e| matches!(e, PipelineEvent::StateChanged(PipelineState::Unhealthy))).await;
    wait_for(&mut events, |e| matches!(e, PipelineEvent::SourceUnhealthy { .. })).await;
    wait_for(&mut events, |e| matches!(e, PipelineEvent::BatchCommitted { to: 1, .. })).await;
    assert_eq!(store.count().await.unwrap(), 1);

    shutdown_tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap().unwrap().slot, 1);
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_the_pipeline() {
    let source = Arc::new(ReplaySource::new());
    source.push_slot(block(1, 0, vec![]));

    let store = Arc::new(InMemoryStorage::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline::new(config("router"), source, store).unwrap();
    let handle = tokio::spawn(pipeline.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(shutdown_tx);

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap();
    assert_eq!(result.unwrap().slot, 1);
}
