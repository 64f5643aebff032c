//! Half-open tick windows.
//!
//! Every occupation the kernel records (resource reservations, storage and
//! connector usages) is a [`Window`] `[start, end)`. A window that ends at
//! tick 200 does not collide with one starting at tick 200.

use crate::fixed::Ticks;
use serde::{Deserialize, Serialize};

/// A half-open interval of simulation time `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: Ticks,
    pub end: Ticks,
}

impl Window {
    /// Create a window. `end < start` is clamped to an empty window at `start`.
    pub fn new(start: Ticks, end: Ticks) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Window of `len` ticks beginning at `start`.
    pub fn starting_at(start: Ticks, len: Ticks) -> Self {
        Self::new(start, start.saturating_add(len))
    }

    pub fn len(&self) -> Ticks {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether two windows share at least one tick.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `tick` falls inside the window.
    pub fn contains(&self, tick: Ticks) -> bool {
        self.start <= tick && tick < self.end
    }

    /// The same length, moved to begin at `start`.
    pub fn shifted_to(&self, start: Ticks) -> Self {
        Self::starting_at(start, self.len())
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touching_windows_do_not_overlap() {
        let a = Window::new(100, 200);
        let b = Window::new(200, 300);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn intersecting_windows_overlap() {
        let a = Window::new(100, 200);
        let b = Window::new(150, 250);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn nested_windows_overlap() {
        assert!(Window::new(0, 100).overlaps(&Window::new(10, 20)));
    }

    #[test]
    fn empty_window_overlaps_nothing() {
        let empty = Window::new(50, 50);
        assert!(empty.is_empty());
        assert!(!empty.overlaps(&Window::new(0, 100)));
    }

    #[test]
    fn inverted_bounds_clamp_to_empty() {
        let w = Window::new(10, 5);
        assert_eq!(w.len(), 0);
        assert_eq!(w.start, 10);
    }

    #[test]
    fn shifted_keeps_length() {
        let w = Window::new(150, 250).shifted_to(200);
        assert_eq!(w, Window::new(200, 300));
    }

    #[test]
    fn contains_is_half_open() {
        let w = Window::new(0, 50);
        assert!(w.contains(0));
        assert!(w.contains(49));
        assert!(!w.contains(50));
    }

    #[test]
    fn display_is_half_open_notation() {
        assert_eq!(Window::new(1, 2).to_string(), "[1,2)");
    }
}
