//! Resource reservation: per-resource occupied-window books.
//!
//! A [`ReservationBook`] keeps a resource's committed windows as a
//! non-overlapping set ordered by start tick. Reserving never merges windows
//! and releasing removes exactly one entry, so a reserve followed by a
//! release leaves the book byte-for-byte as it was.
//!
//! A failed reservation leaves the book untouched and reports the earliest
//! tick at which a window of the same length would fit. The kernel turns
//! that tick into a retry event.

use crate::block::BlockTimes;
use crate::fixed::Ticks;
use crate::id::BatchId;
use crate::time::Window;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    /// Placement failure. Recovered by the kernel with a retry event.
    #[error("window {window} overlaps reserved {conflicting}; next free tick is {next_free}")]
    Overlap {
        window: Window,
        conflicting: Window,
        next_free: Ticks,
    },
    /// Releasing a reservation that does not exist is an error, never a no-op.
    #[error("no reservation {window} is held by this owner")]
    NotReserved { window: Window },
    #[error("cannot reserve an empty window at tick {0}")]
    EmptyWindow(Ticks),
    #[error("unknown resource")]
    UnknownResource,
}

// ---------------------------------------------------------------------------
// ReservationBook
// ---------------------------------------------------------------------------

/// Committed windows of one resource, keyed by start tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationBook {
    windows: BTreeMap<Ticks, (Ticks, BatchId)>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reserved window that intersects `window`, if any.
    ///
    /// Windows are disjoint and sorted, so the last window starting before
    /// `window.end` has the greatest end of all candidates; it is the only
    /// one that needs checking.
    pub fn first_conflict(&self, window: Window) -> Option<Window> {
        let (&start, &(end, _)) = self.windows.range(..window.end).next_back()?;
        let held = Window::new(start, end);
        held.overlaps(&window).then_some(held)
    }

    /// Whether `window` could be reserved right now.
    pub fn is_free(&self, window: Window) -> bool {
        !window.is_empty() && self.first_conflict(window).is_none()
    }

    /// Earliest tick `t >= window.start` at which a window of the same
    /// length fits.
    pub fn next_free(&self, window: Window) -> Ticks {
        let mut candidate = window;
        while let Some(conflict) = self.first_conflict(candidate) {
            candidate = candidate.shifted_to(conflict.end);
        }
        candidate.start
    }

    /// Reserve `window` for `owner`. On failure the book is unchanged.
    pub fn try_reserve(&mut self, window: Window, owner: BatchId) -> Result<(), ReservationError> {
        if window.is_empty() {
            return Err(ReservationError::EmptyWindow(window.start));
        }
        if let Some(conflicting) = self.first_conflict(window) {
            return Err(ReservationError::Overlap {
                window,
                conflicting,
                next_free: self.next_free(window),
            });
        }
        self.windows.insert(window.start, (window.end, owner));
        Ok(())
    }

    /// Remove the reservation `window` held by `owner`.
    pub fn release(&mut self, window: Window, owner: BatchId) -> Result<(), ReservationError> {
        match self.windows.get(&window.start) {
            Some(&(end, held_by)) if end == window.end && held_by == owner => {
                self.windows.remove(&window.start);
                Ok(())
            }
            _ => Err(ReservationError::NotReserved { window }),
        }
    }

    /// The owner of the window starting exactly at `start`.
    pub fn owner_at(&self, start: Ticks) -> Option<BatchId> {
        self.windows.get(&start).map(|&(_, owner)| owner)
    }

    /// Reserved windows in start order.
    pub fn iter(&self) -> impl Iterator<Item = (Window, BatchId)> + '_ {
        self.windows
            .iter()
            .map(|(&start, &(end, owner))| (Window::new(start, end), owner))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }

    /// Whether every pair of windows is disjoint. Always true for books
    /// built through `try_reserve`; used by tests and snapshot validation.
    pub fn is_consistent(&self) -> bool {
        let windows: Vec<Window> = self.iter().map(|(w, _)| w).collect();
        windows.windows(2).all(|pair| pair[0].end <= pair[1].start)
            && windows.iter().all(|w| !w.is_empty())
    }

    /// Rebuild from raw windows (snapshot decoding).
    pub(crate) fn from_windows(
        windows: impl IntoIterator<Item = (Window, BatchId)>,
    ) -> Self {
        Self {
            windows: windows
                .into_iter()
                .map(|(w, owner)| (w.start, (w.end, owner)))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// How a resource services activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    /// One activity at a time. Occupied from block start to storage end.
    Single,
    /// Up to `capacity` activities share one batch. Occupied from batch
    /// start to processing end; completion emits a block-finished event.
    Multitasking { capacity: u32 },
}

impl ResourceKind {
    pub fn is_multitasking(&self) -> bool {
        matches!(self, ResourceKind::Multitasking { .. })
    }

    /// How many activities one batch on this resource can hold.
    pub fn batch_capacity(&self) -> u32 {
        match self {
            ResourceKind::Single => 1,
            ResourceKind::Multitasking { capacity } => (*capacity).max(1),
        }
    }

    /// The window a block with `times` occupies on a resource of this kind.
    pub fn occupied_window(&self, times: &BlockTimes) -> Window {
        match self {
            ResourceKind::Single => Window::new(times.start, times.storage_end),
            ResourceKind::Multitasking { .. } => Window::new(times.start, times.processing_end),
        }
    }
}

/// A schedulable capacity unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    pub(crate) book: ReservationBook,
}

impl Resource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            book: ReservationBook::new(),
        }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self::new(name, ResourceKind::Single)
    }

    pub fn multitasking(name: impl Into<String>, capacity: u32) -> Self {
        Self::new(name, ResourceKind::Multitasking { capacity })
    }

    /// Read-only view of the committed windows.
    pub fn book(&self) -> &ReservationBook {
        &self.book
    }
}
