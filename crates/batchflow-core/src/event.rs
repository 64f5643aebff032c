//! Simulation events and the priority queue that orders them.
//!
//! Every event is stamped with the tick it must fire at. The queue pops the
//! smallest `(tick, type id, sequence)` key, so two events at the same tick
//! always dispatch in [`EventKind`] order and two events of the same kind at
//! the same tick dispatch in enqueue order. That total order is what makes a
//! run replayable.
//!
//! Events never own the entities they mention. A handler re-reads the
//! referenced entity when the event fires, and an event whose precondition
//! was already resolved is filtered as stale instead of being removed from
//! the queue.

use crate::fixed::Ticks;
use crate::id::*;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A future occurrence the kernel must process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A lot reached the end of its shelf life.
    ShelfLifeExpired { lot: LotId },
    /// A usage window on a storage area closed; capacity may be free.
    UsageExpired { area: StorageAreaId },
    /// A batch on a multitasking resource reached processing-end.
    BlockFinished { batch: BatchId },
    /// A tank finished its cleanout.
    CleanoutRetry { area: StorageAreaId },
    /// A saturated connector may have room again.
    ConnectorRetry {
        connector: ConnectorId,
        activity: ActivityId,
    },
    /// More of a lot became available (transfer increment or completion).
    MaterialAvailable { lot: LotId },
    /// A resource that blocked an activity may now be free.
    RetryResourceUsage {
        resource: ResourceId,
        activity: ActivityId,
    },
    /// Attempt to place an activity (initial release or wake-up).
    AttemptReservation { activity: ActivityId },
    /// The planning horizon was reached.
    PlanningHorizonReached,
}

/// Stable type identifier for events. The discriminant is the type id and
/// also the same-tick tie-break: lower ids dispatch first.
///
/// Capacity-releasing kinds come before the retries that need the capacity,
/// and the horizon marker comes last so every event at the horizon tick is
/// still dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum EventKind {
    ShelfLifeExpired = 0,
    UsageExpired = 1,
    BlockFinished = 2,
    CleanoutRetry = 3,
    ConnectorRetry = 4,
    MaterialAvailable = 5,
    RetryResourceUsage = 6,
    AttemptReservation = 7,
    PlanningHorizonReached = 8,
}

/// Total number of event kinds.
pub const EVENT_KIND_COUNT: usize = 9;

impl EventKind {
    /// All kinds in tie-break order.
    pub const ALL: [EventKind; EVENT_KIND_COUNT] = [
        EventKind::ShelfLifeExpired,
        EventKind::UsageExpired,
        EventKind::BlockFinished,
        EventKind::CleanoutRetry,
        EventKind::ConnectorRetry,
        EventKind::MaterialAvailable,
        EventKind::RetryResourceUsage,
        EventKind::AttemptReservation,
        EventKind::PlanningHorizonReached,
    ];

    pub const fn type_id(self) -> u16 {
        self as u16
    }

    pub fn from_type_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::ShelfLifeExpired => "shelf-life-expired",
            EventKind::UsageExpired => "usage-expired",
            EventKind::BlockFinished => "block-finished",
            EventKind::CleanoutRetry => "cleanout-retry",
            EventKind::ConnectorRetry => "connector-retry",
            EventKind::MaterialAvailable => "material-available",
            EventKind::RetryResourceUsage => "retry-resource-usage",
            EventKind::AttemptReservation => "attempt-reservation",
            EventKind::PlanningHorizonReached => "planning-horizon-reached",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Event {
    /// Get the kind (and so the type id) of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ShelfLifeExpired { .. } => EventKind::ShelfLifeExpired,
            Event::UsageExpired { .. } => EventKind::UsageExpired,
            Event::BlockFinished { .. } => EventKind::BlockFinished,
            Event::CleanoutRetry { .. } => EventKind::CleanoutRetry,
            Event::ConnectorRetry { .. } => EventKind::ConnectorRetry,
            Event::MaterialAvailable { .. } => EventKind::MaterialAvailable,
            Event::RetryResourceUsage { .. } => EventKind::RetryResourceUsage,
            Event::AttemptReservation { .. } => EventKind::AttemptReservation,
            Event::PlanningHorizonReached => EventKind::PlanningHorizonReached,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledEvent
// ---------------------------------------------------------------------------

/// An event together with its firing tick and enqueue sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    pub tick: Ticks,
    pub seq: u64,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    fn key(&self) -> (Ticks, u16, u64) {
        (self.tick, self.kind().type_id(), self.seq)
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("event queue is empty")]
    Empty,
}

/// Min-priority queue of scheduled events keyed by `(tick, type id, seq)`.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<ScheduledEvent>>,
    next_seq: u64,
    /// Pending count per kind, so the driver can tell real work from
    /// horizon markers without scanning the heap.
    pending_by_kind: [usize; EVENT_KIND_COUNT],
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event. O(log n). Returns the assigned sequence number.
    pub fn enqueue(&mut self, tick: Ticks, event: Event) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_by_kind[event.kind().index()] += 1;
        self.heap.push(Reverse(ScheduledEvent { tick, seq, event }));
        seq
    }

    /// Remove and return the event with the smallest key.
    pub fn pop_earliest(&mut self) -> Result<ScheduledEvent, QueueError> {
        let Reverse(next) = self.heap.pop().ok_or(QueueError::Empty)?;
        self.pending_by_kind[next.kind().index()] -= 1;
        Ok(next)
    }

    /// The event that would be popped next, without removing it.
    pub fn peek(&self) -> Option<&ScheduledEvent> {
        self.heap.peek().map(|Reverse(e)| e)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Number of queued events of one kind.
    pub fn pending(&self, kind: EventKind) -> usize {
        self.pending_by_kind[kind.index()]
    }

    /// Queued events other than planning-horizon markers.
    pub fn pending_work(&self) -> usize {
        self.len() - self.pending(EventKind::PlanningHorizonReached)
    }

    /// Drop every pending event. Sequence numbers keep increasing.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending_by_kind = [0; EVENT_KIND_COUNT];
    }
}

// ---------------------------------------------------------------------------
// DispatchLog
// ---------------------------------------------------------------------------

/// One dispatched event, as recorded by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub tick: Ticks,
    pub kind: EventKind,
    pub seq: u64,
    /// Whether the handler found the event stale and did nothing.
    pub stale: bool,
}

/// Fixed-capacity ring buffer of dispatch records. When full, the oldest
/// record is dropped.
#[derive(Debug)]
pub struct DispatchLog {
    records: Vec<Option<DispatchRecord>>,
    head: usize,
    len: usize,
    total_written: u64,
}

impl DispatchLog {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: vec![None; capacity],
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn push(&mut self, record: DispatchRecord) {
        self.records[self.head] = Some(record);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn dropped_count(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity() as u64)
    }

    /// Records from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &DispatchRecord> + '_ {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.records[(start + i) % self.capacity()].as_ref())
    }

    pub fn clear(&mut self) {
        self.records.iter_mut().for_each(|r| *r = None);
        self.head = 0;
        self.len = 0;
    }
}
