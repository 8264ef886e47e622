//! Batch fetcher.
//!
//! Wraps a `ChainSource` and turns its raw slot ranges into gap-free batches:
//! every slot in the covered range is present (skipped slots explicitly
//! marked), duplicate deliveries are collapsed, and each produced block is
//! checked against the slot tracker for forks.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::HistoryError;
use crate::source::ChainSource;
use crate::tracker::{ForkSignal, SlotTracker};
use crate::types::{RawTransaction, Slot, SlotContents};

/// One fetched batch.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Every slot in `from+1 ..= next`, in order.
    pub slots: Vec<SlotContents>,
    /// Last slot covered; pass it back as `from` to continue.
    pub next: Slot,
    /// Forks observed while fetching.
    pub forks: Vec<ForkSignal>,
}

impl FetchedBatch {
    /// Returns `true` if the source had nothing new (caught up with the head).
    pub fn is_caught_up(&self) -> bool {
        self.slots.is_empty()
    }

    /// All transactions in slot order.
    pub fn transactions(&self) -> impl Iterator<Item = &RawTransaction> {
        self.slots.iter().flat_map(|s| s.transactions.iter())
    }

    pub fn transaction_count(&self) -> usize {
        self.slots.iter().map(|s| s.transactions.len()).sum()
    }

    pub fn fork_detected(&self) -> bool {
        !self.forks.is_empty()
    }
}

/// Fetcher over a `ChainSource`.
pub struct Fetcher<S: ?Sized> {
    source: Arc<S>,
    program_ids: Vec<String>,
    tracker: Mutex<SlotTracker>,
}

impl<S: ChainSource + ?Sized> Fetcher<S> {
    pub fn new(source: Arc<S>, program_ids: Vec<String>, tracker_window: usize) -> Self {
        Self {
            source,
            program_ids,
            tracker: Mutex::new(SlotTracker::new(tracker_window)),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Fetch the slots after `from`, at most `max_batch_size` of them.
    ///
    /// Returns an empty batch with `next == from` when the source head has not
    /// moved past `from`. Fails with `SourceUnavailable` on transport errors.
    pub async fn fetch_batch(
        &self,
        from: Slot,
        max_batch_size: u64,
    ) -> Result<FetchedBatch, HistoryError> {
        let head = self.source.head_slot().await?;
        if head <= from || max_batch_size == 0 {
            return Ok(FetchedBatch {
                next: from,
                ..Default::default()
            });
        }

        let start = from + 1;
        let end = from.saturating_add(max_batch_size).min(head);
        let raw = self
            .source
            .fetch_slots(start, end, &self.program_ids)
            .await?;

        let mut slots = normalize(start, end, raw);
        for contents in &mut slots {
            contents.transactions.retain(|tx| tx.invokes_any(&self.program_ids));
        }

        let mut forks = Vec::new();
        let mut tracker = self.tracker.lock().unwrap_or_else(|p| p.into_inner());
        for contents in &slots {
            if let Some(fork) = tracker.observe(contents) {
                tracing::warn!(
                    slot = fork.detected_at,
                    depth = fork.depth,
                    expected = %fork.expected_parent,
                    actual = %fork.actual_parent,
                    "fork detected while fetching"
                );
                forks.push(fork);
            }
        }

        Ok(FetchedBatch {
            slots,
            next: end,
            forks,
        })
    }
}

/// Fill gaps in `[start, end]`, drop out-of-range slots, and collapse
/// duplicate slots and signatures (first delivery wins).
pub(crate) fn normalize(start: Slot, end: Slot, raw: Vec<SlotContents>) -> Vec<SlotContents> {
    let mut by_slot: BTreeMap<Slot, SlotContents> = BTreeMap::new();
    for contents in raw {
        if contents.slot < start || contents.slot > end {
            continue;
        }
        match by_slot.get_mut(&contents.slot) {
            Some(existing) => {
                if existing.is_skipped() && !contents.is_skipped() {
                    let mut txs = std::mem::take(&mut existing.transactions);
                    *existing = contents;
                    txs.append(&mut existing.transactions);
                    existing.transactions = txs;
                } else {
                    existing.transactions.extend(contents.transactions);
                }
            }
            None => {
                by_slot.insert(contents.slot, contents);
            }
        }
    }

    let mut seen = HashSet::new();
    (start..=end)
        .map(|slot| {
            let mut contents = by_slot.remove(&slot).unwrap_or_else(|| SlotContents::skipped(slot));
            let block_time = contents.block_time;
            contents.transactions.retain_mut(|tx| {
                if tx.block_time.is_none() {
                    tx.block_time = block_time;
                }
                tx.slot = slot;
                seen.insert(tx.signature.clone())
            });
            contents
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ReplaySource;
    use crate::types::RawInstruction;

    const ROUTER: &str = "router";

    fn tx(sig: &str, slot: Slot) -> RawTransaction {
        RawTransaction {
            signature: sig.into(),
            slot,
            block_time: None,
            err: None,
            instructions: vec![RawInstruction { program_id: ROUTER.into(), data: String::new() }],
            inner_instructions: vec![],
        }
    }

    fn block(n: Slot, parent: Slot, txs: Vec<RawTransaction>) -> SlotContents {
        SlotContents {
            slot: n,
            blockhash: Some(format!("h{n}")),
            parent_blockhash: Some(format!("h{parent}")),
            block_time: Some(1_000 + n as i64),
            transactions: txs,
        }
    }

    fn fetcher(src: Arc<ReplaySource>) -> Fetcher<ReplaySource> {
        Fetcher::new(src, vec![ROUTER.to_string()], 64)
    }

    #[tokio::test]
    async fn gaps_are_marked_skipped() {
        let src = Arc::new(ReplaySource::new());
        src.push_slot(block(11, 10, vec![tx("a", 11)]));
        src.push_slot(block(14, 11, vec![tx("b", 14)]));

        let batch = fetcher(src).fetch_batch(10, 10).await.unwrap();
        assert_eq!(batch.next, 14);
        let slots: Vec<_> = batch.slots.iter().map(|s| s.slot).collect();
        assert_eq!(slots, vec![11, 12, 13, 14]);
        assert!(batch.slots[1].is_skipped());
        assert!(batch.slots[2].is_skipped());
        assert_eq!(batch.transaction_count(), 2);
    }

    #[tokio::test]
    async fn batch_size_and_continuation() {
        let src = Arc::new(ReplaySource::new());
        for n in 1..=10 {
            src.push_slot(block(n, n - 1, vec![tx(&format!("s{n}"), n)]));
        }
        let f = fetcher(src);

        let first = f.fetch_batch(0, 4).await.unwrap();
        assert_eq!(first.next, 4);
        assert_eq!(first.transaction_count(), 4);

        let second = f.fetch_batch(first.next, 4).await.unwrap();
        assert_eq!(second.slots.first().unwrap().slot, 5);
        assert_eq!(second.next, 8);

        // re-delivery from an earlier position is valid
        let again = f.fetch_batch(0, 4).await.unwrap();
        assert_eq!(again.transaction_count(), 4);
        assert!(!again.fork_detected());
    }

    #[tokio::test]
    async fn caught_up_is_empty_not_error() {
        let src = Arc::new(ReplaySource::new());
        src.push_slot(block(5, 4, vec![]));
        let batch = fetcher(src).fetch_batch(5, 100).await.unwrap();
        assert!(batch.is_caught_up());
        assert_eq!(batch.next, 5);
    }

    #[tokio::test]
    async fn transport_failure_surfaces() {
        let src = Arc::new(ReplaySource::new());
        src.push_slot(block(5, 4, vec![]));
        src.fail_next(1);
        let err = fetcher(src).fetch_batch(0, 10).await.unwrap_err();
        assert!(matches!(err, HistoryError::SourceUnavailable(_)));
    }

    #[test]
    fn normalize_drops_duplicates_and_inherits_block_time() {
        let raw = vec![
            block(3, 2, vec![tx("a", 3), tx("a", 3)]),
            block(3, 2, vec![tx("b", 3)]),
            block(4, 3, vec![tx("a", 4)]),
            block(9, 8, vec![tx("z", 9)]),
        ];
        let slots = normalize(3, 4, raw);
        assert_eq!(slots.len(), 2);
        let sigs: Vec<_> = slots
            .iter()
            .flat_map(|s| s.transactions.iter().map(|t| t.signature.as_str().to_string()))
            .collect();
        assert_eq!(sigs, vec!["a", "b"]);
        assert_eq!(slots[0].transactions[0].block_time, Some(1_003));
    }

    #[tokio::test]
    async fn fork_reported_on_parent_mismatch() {
        let src = Arc::new(ReplaySource::new());
        src.push_slot(block(1, 0, vec![]));
        src.push_slot(block(2, 1, vec![]));
        let f = fetcher(src.clone());
        f.fetch_batch(0, 10).await.unwrap();

        // slot 3 builds on a block that is not slot 2
        src.push_slot(SlotContents {
            parent_blockhash: Some("h1".into()),
            ..block(3, 2, vec![])
        });
        let batch = f.fetch_batch(2, 10).await.unwrap();
        assert!(batch.fork_detected());
    }
}
