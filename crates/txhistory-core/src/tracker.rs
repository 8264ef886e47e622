//! Slot tracker: maintains a sliding window of recently produced blocks for
//! parent-hash verification.
//!
//! Skipped slots produce no block, so a block's parent is the most recent
//! *produced* block, not necessarily `slot - 1`. A parent-hash mismatch means
//! the chain the fetcher is reading has forked away from what was recorded.

use std::collections::VecDeque;

use crate::types::{Slot, SlotContents};

/// A produced block in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedBlock {
    pub slot: Slot,
    pub blockhash: String,
}

/// Describes a detected fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkSignal {
    /// Slot of the block whose parent did not match.
    pub detected_at: Slot,
    /// Hash the tracker expected as parent.
    pub expected_parent: String,
    /// Parent hash the new block reports.
    pub actual_parent: String,
    /// Number of tracked blocks discarded from the window.
    pub depth: u64,
}

/// Tracks the last N produced blocks.
pub struct SlotTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<TrackedBlock>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl SlotTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Observe one slot of a fetched batch.
    ///
    /// Skipped slots and blocks without a parent hash are accepted silently.
    /// On a mismatch the window is rewound to the common ancestor (or cleared
    /// if the ancestor is outside the window) and the new block becomes head.
    pub fn observe(&mut self, contents: &SlotContents) -> Option<ForkSignal> {
        let blockhash = contents.blockhash.as_ref()?;

        // Re-delivery of an already tracked slot: compare hashes directly.
        if let Some(pos) = self.window.iter().position(|b| b.slot == contents.slot) {
            if &self.window[pos].blockhash == blockhash {
                return None;
            }
            let dropped = self.window.len() - pos;
            let expected = self.window[pos].blockhash.clone();
            self.window.truncate(pos);
            self.push(contents.slot, blockhash.clone());
            return Some(ForkSignal {
                detected_at: contents.slot,
                expected_parent: expected,
                actual_parent: contents.parent_blockhash.clone().unwrap_or_default(),
                depth: dropped as u64,
            });
        }

        // Older than the window, or a slot below the head that was skipped
        // when first seen: nothing to compare against.
        if self.head().is_some_and(|head| contents.slot <= head.slot) {
            return None;
        }

        let mismatch = match (self.head(), contents.parent_blockhash.as_ref()) {
            (Some(head), Some(parent)) if &head.blockhash != parent => {
                Some((head.blockhash.clone(), parent.clone()))
            }
            _ => None,
        };
        let signal = mismatch.map(|(expected, parent)| {
            let depth = self.rewind_to_ancestor(&parent);
            ForkSignal {
                detected_at: contents.slot,
                expected_parent: expected,
                actual_parent: parent,
                depth,
            }
        });

        self.push(contents.slot, blockhash.clone());
        signal
    }

    /// Returns the most recently added block.
    pub fn head(&self) -> Option<&TrackedBlock> {
        self.window.back()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn push(&mut self, slot: Slot, blockhash: String) {
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(TrackedBlock { slot, blockhash });
    }

    /// Drop blocks newer than the one whose hash is `parent`; returns how many.
    fn rewind_to_ancestor(&mut self, parent: &str) -> u64 {
        match self.window.iter().rposition(|b| b.blockhash == parent) {
            Some(i) => {
                let dropped = self.window.len() - 1 - i;
                self.window.truncate(i + 1);
                dropped as u64
            }
            None => {
                // Common ancestor not in window
                let dropped = self.window.len();
                self.window.clear();
                dropped as u64
            }
        }
    }
}
