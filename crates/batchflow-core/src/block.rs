//! Blocks and batches: placed intervals of resource occupation.
//!
//! A block records the five lifecycle ticks of one activity on one resource
//! (start, setup-end, processing-end, post-processing-end, clean-end) plus a
//! trailing storage end. Every span is derived from those ticks and never
//! stored.
//!
//! A batch groups the blocks that share one placement on a resource. On a
//! single resource every batch holds exactly one block; on a multitasking
//! resource several activities merge into one batch.

use crate::fixed::Ticks;
use crate::id::{ActivityId, BatchId, BlockId, ResourceId};
use crate::time::Window;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block ticks are not monotonic: {0:?}")]
    NonMonotonic([Ticks; 6]),
    #[error("batches differ in {0} and cannot be merged")]
    MergeMismatch(&'static str),
    #[error("batch {0:?} is full")]
    BatchFull(BatchId),
}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// Lifecycle durations of an activity, in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Spans {
    pub setup: Ticks,
    pub run: Ticks,
    pub post_processing: Ticks,
    pub clean: Ticks,
    pub storage: Ticks,
}

impl Spans {
    pub fn new(setup: Ticks, run: Ticks, post_processing: Ticks, clean: Ticks, storage: Ticks) -> Self {
        Self {
            setup,
            run,
            post_processing,
            clean,
            storage,
        }
    }

    /// Only a run span.
    pub fn run_only(run: Ticks) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    pub fn total(&self) -> Ticks {
        self.setup
            .saturating_add(self.run)
            .saturating_add(self.post_processing)
            .saturating_add(self.clean)
            .saturating_add(self.storage)
    }
}

// ---------------------------------------------------------------------------
// BlockTimes
// ---------------------------------------------------------------------------

/// The monotonic tick sequence of a placed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockTimes {
    pub start: Ticks,
    pub setup_end: Ticks,
    pub processing_end: Ticks,
    pub post_processing_end: Ticks,
    pub clean_end: Ticks,
    pub storage_end: Ticks,
}

impl BlockTimes {
    /// Build from explicit ticks, rejecting any backwards step.
    pub fn new(
        start: Ticks,
        setup_end: Ticks,
        processing_end: Ticks,
        post_processing_end: Ticks,
        clean_end: Ticks,
        storage_end: Ticks,
    ) -> Result<Self, BlockError> {
        let ticks = [
            start,
            setup_end,
            processing_end,
            post_processing_end,
            clean_end,
            storage_end,
        ];
        if ticks.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(BlockError::NonMonotonic(ticks));
        }
        Ok(Self {
            start,
            setup_end,
            processing_end,
            post_processing_end,
            clean_end,
            storage_end,
        })
    }

    /// Lay `spans` out back to back from `start`. Always monotonic.
    pub fn from_spans(start: Ticks, spans: &Spans) -> Self {
        let setup_end = start.saturating_add(spans.setup);
        let processing_end = setup_end.saturating_add(spans.run);
        let post_processing_end = processing_end.saturating_add(spans.post_processing);
        let clean_end = post_processing_end.saturating_add(spans.clean);
        let storage_end = clean_end.saturating_add(spans.storage);
        Self {
            start,
            setup_end,
            processing_end,
            post_processing_end,
            clean_end,
            storage_end,
        }
    }

    pub fn is_monotonic(&self) -> bool {
        self.start <= self.setup_end
            && self.setup_end <= self.processing_end
            && self.processing_end <= self.post_processing_end
            && self.post_processing_end <= self.clean_end
            && self.clean_end <= self.storage_end
    }

    pub fn setup_span(&self) -> Ticks {
        self.setup_end - self.start
    }

    pub fn run_span(&self) -> Ticks {
        self.processing_end - self.setup_end
    }

    pub fn post_processing_span(&self) -> Ticks {
        self.post_processing_end - self.processing_end
    }

    pub fn clean_span(&self) -> Ticks {
        self.clean_end - self.post_processing_end
    }

    pub fn storage_span(&self) -> Ticks {
        self.storage_end - self.clean_end
    }

    pub fn total_duration(&self) -> Ticks {
        self.storage_end - self.start
    }

    /// The run phase `[setup_end, processing_end)`, during which material
    /// flows in and out of storage.
    pub fn run_window(&self) -> Window {
        Window::new(self.setup_end, self.processing_end)
    }

    /// The spans these times were laid out from.
    pub fn spans(&self) -> Spans {
        Spans {
            setup: self.setup_span(),
            run: self.run_span(),
            post_processing: self.post_processing_span(),
            clean: self.clean_span(),
            storage: self.storage_span(),
        }
    }
}

// ---------------------------------------------------------------------------
// Block & Batch
// ---------------------------------------------------------------------------

/// One activity's occupation of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub activity: ActivityId,
    pub resource: ResourceId,
    pub batch: BatchId,
    pub times: BlockTimes,
}

/// Blocks sharing one placement on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub resource: ResourceId,
    pub times: BlockTimes,
    /// The reserved window on the resource.
    pub window: Window,
    pub blocks: Vec<BlockId>,
}

impl Batch {
    pub fn new(resource: ResourceId, times: BlockTimes, window: Window) -> Self {
        Self {
            resource,
            times,
            window,
            blocks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether another block with `times` may join under `capacity`.
    pub fn can_join(&self, times: &BlockTimes, capacity: u32) -> bool {
        self.times == *times && (self.blocks.len() as u32) < capacity
    }

    /// Batch-merge: move every block of `other` into `self`.
    ///
    /// Both batches must sit on the same resource with identical times and
    /// the combined size must fit `capacity`. On error neither batch changes.
    pub fn absorb(&mut self, other: &mut Batch, capacity: u32) -> Result<(), BlockError> {
        if self.resource != other.resource {
            return Err(BlockError::MergeMismatch("resource"));
        }
        if self.times != other.times {
            return Err(BlockError::MergeMismatch("times"));
        }
        if (self.blocks.len() + other.blocks.len()) as u32 > capacity {
            return Err(BlockError::MergeMismatch("capacity"));
        }
        self.blocks.append(&mut other.blocks);
        Ok(())
    }

    /// Detach a block. Returns whether it was a member.
    pub fn remove_block(&mut self, block: BlockId) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| *b != block);
        self.blocks.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn from_spans_lays_out_back_to_back() {
        let t = BlockTimes::from_spans(100, &Spans::new(5, 20, 3, 2, 10));
        assert_eq!(t.start, 100);
        assert_eq!(t.setup_end, 105);
        assert_eq!(t.processing_end, 125);
        assert_eq!(t.post_processing_end, 128);
        assert_eq!(t.clean_end, 130);
        assert_eq!(t.storage_end, 140);
        assert!(t.is_monotonic());
    }

    #[test]
    fn derived_spans_match_inputs() {
        let spans = Spans::new(5, 20, 3, 2, 10);
        let t = BlockTimes::from_spans(100, &spans);
        assert_eq!(t.setup_span(), 5);
        assert_eq!(t.run_span(), 20);
        assert_eq!(t.post_processing_span(), 3);
        assert_eq!(t.clean_span(), 2);
        assert_eq!(t.storage_span(), 10);
        assert_eq!(t.total_duration(), 40);
        assert_eq!(t.spans(), spans);
        assert_eq!(spans.total(), 40);
    }

    #[test]
    fn non_monotonic_ticks_rejected() {
        let err = BlockTimes::new(0, 10, 5, 20, 30, 40).unwrap_err();
        assert_eq!(err, BlockError::NonMonotonic([0, 10, 5, 20, 30, 40]));
    }

    #[test]
    fn zero_spans_are_allowed() {
        let t = BlockTimes::new(7, 7, 7, 7, 7, 7).unwrap();
        assert_eq!(t.total_duration(), 0);
    }

    #[test]
    fn run_window_covers_processing_phase() {
        let t = BlockTimes::from_spans(0, &Spans::new(5, 45, 0, 0, 0));
        assert_eq!(t.run_window(), Window::new(5, 50));
    }

    fn ids() -> (ResourceId, ResourceId, Vec<BlockId>) {
        let mut rs = SlotMap::<ResourceId, ()>::with_key();
        let mut bs = SlotMap::<BlockId, ()>::with_key();
        (rs.insert(()), rs.insert(()), (0..4).map(|_| bs.insert(())).collect())
    }

    #[test]
    fn absorb_merges_matching_batches() {
        let (r, _, b) = ids();
        let times = BlockTimes::from_spans(0, &Spans::run_only(10));
        let mut a = Batch::new(r, times, Window::new(0, 10));
        a.blocks.push(b[0]);
        let mut other = Batch::new(r, times, Window::new(0, 10));
        other.blocks.push(b[1]);

        a.absorb(&mut other, 3).unwrap();
        assert_eq!(a.blocks, vec![b[0], b[1]]);
        assert!(other.is_empty());
    }

    #[test]
    fn absorb_rejects_mismatch_without_mutation() {
        let (r1, r2, b) = ids();
        let times = BlockTimes::from_spans(0, &Spans::run_only(10));
        let mut a = Batch::new(r1, times, Window::new(0, 10));
        a.blocks.push(b[0]);
        let mut other = Batch::new(r2, times, Window::new(0, 10));
        other.blocks.push(b[1]);
        assert_eq!(
            a.absorb(&mut other, 5),
            Err(BlockError::MergeMismatch("resource"))
        );

        let later = BlockTimes::from_spans(5, &Spans::run_only(10));
        let mut shifted = Batch::new(r1, later, Window::new(5, 15));
        shifted.blocks.push(b[2]);
        assert_eq!(
            a.absorb(&mut shifted, 5),
            Err(BlockError::MergeMismatch("times"))
        );

        let mut same = Batch::new(r1, times, Window::new(0, 10));
        same.blocks.push(b[3]);
        assert_eq!(a.absorb(&mut same, 1), Err(BlockError::MergeMismatch("capacity")));
        assert_eq!(a.len(), 1);
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn can_join_respects_capacity_and_times() {
        let (r, _, b) = ids();
        let times = BlockTimes::from_spans(0, &Spans::run_only(10));
        let mut batch = Batch::new(r, times, Window::new(0, 10));
        batch.blocks.push(b[0]);
        assert!(batch.can_join(&times, 2));
        assert!(!batch.can_join(&times, 1));
        let other = BlockTimes::from_spans(0, &Spans::run_only(11));
        assert!(!batch.can_join(&other, 2));
    }

    #[test]
    fn remove_block_reports_membership() {
        let (r, _, b) = ids();
        let times = BlockTimes::from_spans(0, &Spans::run_only(10));
        let mut batch = Batch::new(r, times, Window::new(0, 10));
        batch.blocks.push(b[0]);
        assert!(batch.remove_block(b[0]));
        assert!(!batch.remove_block(b[0]));
        assert!(batch.is_empty());
    }
}
