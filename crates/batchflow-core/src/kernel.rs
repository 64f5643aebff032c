//! The scheduling kernel: owns the entity graph and drives the event loop.
//!
//! # Architecture
//!
//! The `Kernel` owns:
//! - Arenas for activities, resources, lots, inventories, storage areas,
//!   connectors, blocks and batches (all keyed by slotmap ids)
//! - The material catalog, indexed by [`MaterialId`]
//! - An [`EventQueue`] and the simulated clock
//! - Parking lists of activities waiting on a batch, a material or an area
//!
//! # Event loop
//!
//! `run_to(horizon)` pops events in `(tick, type id, seq)` order and hands
//! each to its handler. Handlers re-check live state before acting, so an
//! event made obsolete by an earlier handler is recorded as stale and
//! skipped. Placement attempts live in [`crate::placement`].

use crate::activity::{Activity, ActivityError, ActivityState, Placement, UsageTarget, WaitReason};
use crate::block::{Batch, Block, BlockError};
use crate::event::{DispatchLog, DispatchRecord, Event, EventQueue, QueueError, ScheduledEvent};
use crate::fixed::Ticks;
use crate::id::*;
use crate::material::{EligibilityError, Inventory, Lot, MaterialDef, MaterialError};
use crate::reservation::{ReservationError, Resource};
use crate::sim::{KernelConfig, RunOutcome, RunReport, RunState, StateHash};
use crate::storage::{StorageArea, StorageAreaConnector, StorageError, UsageLedger};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Contract violations raised by kernel operations. Inside a run these end
/// the run with [`RunOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Material(#[from] MaterialError),
    /// Surfaced by lot selection. The built-in policies only query an
    /// eligible-lot set they actually carry.
    #[error(transparent)]
    Eligibility(#[from] EligibilityError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error("activity {0} already exists")]
    DuplicateActivity(ActivityKey),
    #[error("unknown activity")]
    UnknownActivity,
    #[error("unknown resource")]
    UnknownResource,
    #[error("unknown storage area")]
    UnknownArea,
    #[error("unknown connector")]
    UnknownConnector,
    #[error("unknown batch")]
    UnknownBatch,
    #[error("unknown material {0:?}")]
    UnknownMaterial(MaterialId),
    #[error("the kernel is running")]
    Running,
}

/// What an activity is parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum WaitKey {
    Batch(BatchId),
    Material(MaterialId),
    Area(StorageAreaId),
}

impl WaitKey {
    /// The parking list for a wait reason, if it parks at all. Resource and
    /// connector waits carry their own retry event instead.
    pub(crate) fn for_reason(reason: &WaitReason) -> Option<Self> {
        match *reason {
            WaitReason::Batch(batch) => Some(WaitKey::Batch(batch)),
            WaitReason::Material(material) => Some(WaitKey::Material(material)),
            WaitReason::StorageArea(area) => Some(WaitKey::Area(area)),
            WaitReason::Resource { .. } | WaitReason::Connector { .. } => None,
        }
    }
}

/// Result of handing one event to its handler.
enum Dispatch {
    Handled { stale: bool },
    /// The planning horizon stops the run.
    Halt,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// The discrete-event scheduling kernel.
#[derive(Debug)]
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) state: RunState,
    pub(crate) clock: Ticks,
    /// Current planning horizon, including extensions.
    pub(crate) horizon: Ticks,
    pub(crate) extensions_used: u32,
    /// Whether initial events have been queued for this run.
    pub(crate) seeded: bool,
    pub(crate) queue: EventQueue,
    pub(crate) log: DispatchLog,
    pub(crate) dispatched_total: u64,

    pub(crate) materials: Vec<MaterialDef>,
    pub(crate) resources: SlotMap<ResourceId, Resource>,
    pub(crate) areas: SlotMap<StorageAreaId, StorageArea>,
    pub(crate) connectors: SlotMap<ConnectorId, StorageAreaConnector>,

    pub(crate) activities: SlotMap<ActivityId, Activity>,
    /// Activities in insertion order. Seeding and reporting follow it.
    pub(crate) activity_order: Vec<ActivityId>,
    pub(crate) activity_keys: BTreeMap<ActivityKey, ActivityId>,

    pub(crate) lots: SlotMap<LotId, Lot>,
    /// Lots in creation order, the tie-break for FIFO draws.
    pub(crate) lot_order: Vec<LotId>,
    pub(crate) inventories: SlotMap<InventoryId, Inventory>,

    pub(crate) blocks: SlotMap<BlockId, Block>,
    pub(crate) batches: SlotMap<BatchId, Batch>,
    pub(crate) placements: SecondaryMap<ActivityId, Placement>,

    pub(crate) waiters: BTreeMap<WaitKey, Vec<ActivityId>>,
    pub(crate) last_failure: SecondaryMap<ActivityId, String>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            state: RunState::Idle,
            clock: 0,
            horizon: config.planning_horizon,
            extensions_used: 0,
            seeded: false,
            queue: EventQueue::new(),
            log: DispatchLog::new(config.dispatch_log_capacity),
            dispatched_total: 0,
            config,
            materials: Vec::new(),
            resources: SlotMap::with_key(),
            areas: SlotMap::with_key(),
            connectors: SlotMap::with_key(),
            activities: SlotMap::with_key(),
            activity_order: Vec::new(),
            activity_keys: BTreeMap::new(),
            lots: SlotMap::with_key(),
            lot_order: Vec::new(),
            inventories: SlotMap::with_key(),
            blocks: SlotMap::with_key(),
            batches: SlotMap::with_key(),
            placements: SecondaryMap::new(),
            waiters: BTreeMap::new(),
            last_failure: SecondaryMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Building the entity graph
    // -----------------------------------------------------------------------

    pub fn add_material(&mut self, def: MaterialDef) -> MaterialId {
        let id = MaterialId(self.materials.len() as u32);
        self.materials.push(def);
        id
    }

    pub fn add_resource(&mut self, resource: Resource) -> ResourceId {
        self.resources.insert(resource)
    }

    pub fn add_area(&mut self, area: StorageArea) -> StorageAreaId {
        self.areas.insert(area)
    }

    pub fn add_connector(&mut self, connector: StorageAreaConnector) -> Result<ConnectorId, KernelError> {
        for end in [connector.from, connector.to].into_iter().flatten() {
            if !self.areas.contains_key(end) {
                return Err(KernelError::UnknownArea);
            }
        }
        Ok(self.connectors.insert(connector))
    }

    /// Add a lot of on-hand material. A lot with a location gets an
    /// inventory record in that area; a lot of a material with a shelf life
    /// and no explicit expiry expires `shelf_life` ticks after production.
    pub fn add_lot(&mut self, mut lot: Lot) -> Result<LotId, KernelError> {
        if self.state == RunState::Running {
            return Err(KernelError::Running);
        }
        let def = self
            .materials
            .get(lot.material.0 as usize)
            .ok_or(KernelError::UnknownMaterial(lot.material))?;
        if lot.expires_at.is_none() {
            lot.expires_at = def.shelf_life.map(|s| lot.produced_at.saturating_add(s));
        }
        if let Some(area) = lot.location {
            self.areas
                .get(area)
                .ok_or(KernelError::UnknownArea)?
                .check_accepts_inventory()?;
        }
        let location = lot.location;
        let expires_at = lot.expires_at;
        let releases = lot.transfer.release_ticks(lot.flow);
        let id = self.lots.insert(lot);
        self.lot_order.push(id);
        if let Some(area) = location {
            self.store(id, area)?;
        }
        if self.seeded {
            let now = self.clock;
            for tick in releases.into_iter().filter(|&t| t > now) {
                self.schedule(tick, Event::MaterialAvailable { lot: id });
            }
            if let Some(tick) = expires_at {
                self.schedule(tick, Event::ShelfLifeExpired { lot: id });
            }
        }
        Ok(id)
    }

    /// Add an activity. Added after a run started, it is attempted at
    /// `max(release, clock)`.
    pub fn add_activity(&mut self, activity: Activity) -> Result<ActivityId, KernelError> {
        if self.state == RunState::Running {
            return Err(KernelError::Running);
        }
        activity.validate()?;
        if self.activity_keys.contains_key(&activity.key) {
            return Err(KernelError::DuplicateActivity(activity.key));
        }
        for req in &activity.resources {
            if req.candidates.iter().any(|r| !self.resources.contains_key(*r)) {
                return Err(KernelError::UnknownResource);
            }
        }
        for req in &activity.materials {
            self.material(req.material)?;
            if req.source.is_some_and(|a| !self.areas.contains_key(a)) {
                return Err(KernelError::UnknownArea);
            }
            if req.connector.is_some_and(|c| !self.connectors.contains_key(c)) {
                return Err(KernelError::UnknownConnector);
            }
        }
        if let Some(out) = &activity.output {
            self.material(out.material)?;
            if out.storage.is_some_and(|a| !self.areas.contains_key(a)) {
                return Err(KernelError::UnknownArea);
            }
            if out.connector.is_some_and(|c| !self.connectors.contains_key(c)) {
                return Err(KernelError::UnknownConnector);
            }
        }

        let key = activity.key;
        let release = activity.release;
        let id = self.activities.insert(activity);
        self.activity_order.push(id);
        self.activity_keys.insert(key, id);
        if self.seeded {
            self.schedule(release.max(self.clock), Event::AttemptReservation { activity: id });
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> Ticks {
        self.clock
    }

    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    pub fn horizon(&self) -> Ticks {
        self.horizon
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatch_log(&self) -> &DispatchLog {
        &self.log
    }

    pub fn material(&self, id: MaterialId) -> Result<&MaterialDef, KernelError> {
        self.materials
            .get(id.0 as usize)
            .ok_or(KernelError::UnknownMaterial(id))
    }

    pub fn materials(&self) -> &[MaterialDef] {
        &self.materials
    }

    pub fn activity(&self, id: ActivityId) -> Option<&Activity> {
        self.activities.get(id)
    }

    pub fn find_activity(&self, key: ActivityKey) -> Option<ActivityId> {
        self.activity_keys.get(&key).copied()
    }

    /// Activities in insertion order.
    pub fn activities(&self) -> impl Iterator<Item = (ActivityId, &Activity)> + '_ {
        self.activity_order
            .iter()
            .filter_map(|&id| self.activities.get(id).map(|a| (id, a)))
    }

    pub fn placement(&self, id: ActivityId) -> Option<&Placement> {
        self.placements.get(id)
    }

    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = (ResourceId, &Resource)> + '_ {
        self.resources.iter()
    }

    pub fn area(&self, id: StorageAreaId) -> Option<&StorageArea> {
        self.areas.get(id)
    }

    pub fn areas(&self) -> impl Iterator<Item = (StorageAreaId, &StorageArea)> + '_ {
        self.areas.iter()
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&StorageAreaConnector> {
        self.connectors.get(id)
    }

    pub fn lot(&self, id: LotId) -> Option<&Lot> {
        self.lots.get(id)
    }

    /// Lots in creation order.
    pub fn lots(&self) -> impl Iterator<Item = (LotId, &Lot)> + '_ {
        self.lot_order
            .iter()
            .filter_map(|&id| self.lots.get(id).map(|l| (id, l)))
    }

    pub fn inventory(&self, id: InventoryId) -> Option<&Inventory> {
        self.inventories.get(id)
    }

    pub fn inventories(&self) -> impl Iterator<Item = (InventoryId, &Inventory)> + '_ {
        self.inventories.iter()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.blocks.iter()
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.get(id)
    }

    /// Last placement failure recorded for an activity.
    pub fn last_failure(&self, id: ActivityId) -> Option<&str> {
        self.last_failure.get(id).map(String::as_str)
    }

    /// Activities without a placement, with their last failure reason.
    pub fn unplaced(&self) -> Vec<(ActivityKey, String)> {
        self.activities()
            .filter(|(_, a)| !a.is_placed())
            .map(|(id, a)| {
                let reason = match a.state() {
                    ActivityState::Unplaceable(reason) => reason.clone(),
                    _ => self
                        .last_failure(id)
                        .unwrap_or("not attempted")
                        .to_string(),
                };
                (a.key, reason)
            })
            .collect()
    }

    pub(crate) fn ledger(&self, target: UsageTarget) -> Result<&UsageLedger, KernelError> {
        match target {
            UsageTarget::Area(a) => self
                .areas
                .get(a)
                .map(|area| &area.ledger)
                .ok_or(KernelError::UnknownArea),
            UsageTarget::Connector(c) => self
                .connectors
                .get(c)
                .map(|conn| &conn.ledger)
                .ok_or(KernelError::UnknownConnector),
        }
    }

    pub(crate) fn ledger_mut(&mut self, target: UsageTarget) -> Result<&mut UsageLedger, KernelError> {
        match target {
            UsageTarget::Area(a) => self
                .areas
                .get_mut(a)
                .map(|area| &mut area.ledger)
                .ok_or(KernelError::UnknownArea),
            UsageTarget::Connector(c) => self
                .connectors
                .get_mut(c)
                .map(|conn| &mut conn.ledger)
                .ok_or(KernelError::UnknownConnector),
        }
    }

    /// Deterministic hash of the scheduling outcome so far.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.clock);
        for (id, activity) in self.activities() {
            h.write_u32(activity.key.job.0);
            h.write_u32(activity.key.order.0);
            h.write_u32(activity.key.operation.0);
            match self.placements.get(id) {
                Some(p) => {
                    h.write_u64(p.times.start);
                    h.write_u64(p.times.storage_end);
                    h.write_u32(p.blocks.len() as u32);
                }
                None => h.write_u64(u64::MAX),
            }
        }
        for (_, lot) in self.lots() {
            h.write(lot.code.as_str().as_bytes());
            h.write_quantity(lot.consumed);
            h.write_u32(lot.uses);
            h.write(&[lot.expired as u8]);
        }
        h.finish()
    }

    // -----------------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------------

    /// Queue an event. Ticks before the clock are clamped to the clock.
    pub(crate) fn schedule(&mut self, tick: Ticks, event: Event) {
        let tick = if tick < self.clock {
            warn!(
                requested = tick,
                clock = self.clock,
                kind = %event.kind(),
                "event scheduled in the past, clamped to clock"
            );
            self.clock
        } else {
            tick
        };
        let seq = self.queue.enqueue(tick, event);
        trace!(tick, seq, kind = %event.kind(), "enqueue");
    }

    /// Park an activity on a wait reason. Reasons that do not park get their
    /// retry event queued instead.
    pub(crate) fn park(&mut self, id: ActivityId, reason: WaitReason) {
        if let Some(activity) = self.activities.get_mut(id) {
            activity.state = ActivityState::Waiting(reason);
        }
        match reason {
            WaitReason::Resource { resource, until } => {
                self.schedule(until, Event::RetryResourceUsage { resource, activity: id });
            }
            WaitReason::Connector { connector, until } => {
                self.schedule(until, Event::ConnectorRetry { connector, activity: id });
            }
            _ => {
                if let Some(key) = WaitKey::for_reason(&reason) {
                    self.waiters.entry(key).or_default().push(id);
                }
            }
        }
    }

    /// Wake every activity parked on `key` with an attempt at the current
    /// tick. Returns how many were woken.
    pub(crate) fn wake(&mut self, key: WaitKey) -> usize {
        let Some(parked) = self.waiters.remove(&key) else {
            return 0;
        };
        let mut woken = 0;
        for id in parked {
            let Some(activity) = self.activities.get_mut(id) else {
                continue;
            };
            let still_waiting = match &activity.state {
                ActivityState::Waiting(reason) => WaitKey::for_reason(reason) == Some(key),
                _ => false,
            };
            if still_waiting {
                activity.state = ActivityState::Pending;
                woken += 1;
                self.schedule(self.clock, Event::AttemptReservation { activity: id });
            }
        }
        woken
    }

    /// Wake activities waiting on a resource or connector retry whose
    /// blocker matches `pred`. Their queued retry events become stale.
    pub(crate) fn wake_retries(&mut self, pred: impl Fn(&WaitReason) -> bool) -> usize {
        let ids: Vec<ActivityId> = self
            .activity_order
            .iter()
            .copied()
            .filter(|&id| {
                self.activities.get(id).is_some_and(|a| match &a.state {
                    ActivityState::Waiting(reason) => pred(reason),
                    _ => false,
                })
            })
            .collect();
        for &id in &ids {
            if let Some(activity) = self.activities.get_mut(id) {
                activity.state = ActivityState::Pending;
            }
            self.schedule(self.clock, Event::AttemptReservation { activity: id });
        }
        ids.len()
    }

    /// Request a fresh placement attempt at the current tick for an activity
    /// that is pending or was given up on.
    pub fn request_attempt(&mut self, id: ActivityId) -> Result<(), KernelError> {
        let activity = self.activities.get_mut(id).ok_or(KernelError::UnknownActivity)?;
        if activity.is_placed() {
            return Ok(());
        }
        activity.state = ActivityState::Pending;
        if self.seeded {
            let tick = activity.release.max(self.clock);
            self.schedule(tick, Event::AttemptReservation { activity: id });
        }
        Ok(())
    }

    /// Create an inventory for `lot` in `area` and occupy the tank, if any.
    pub(crate) fn store(&mut self, lot_id: LotId, area: StorageAreaId) -> Result<InventoryId, KernelError> {
        let lot = self.lots.get(lot_id).ok_or(MaterialError::UnknownLot)?;
        let inventory = Inventory::for_lot(lot_id, lot, area);
        let storage = self.areas.get_mut(area).ok_or(KernelError::UnknownArea)?;
        storage.check_accepts_inventory()?;
        let id = self.inventories.insert(inventory);
        if let Err(err) = storage.occupy(id) {
            self.inventories.remove(id);
            return Err(err.into());
        }
        Ok(id)
    }

    pub(crate) fn inventory_of(&self, lot: LotId) -> Option<InventoryId> {
        self.inventories
            .iter()
            .find(|(_, inv)| inv.lot == lot)
            .map(|(id, _)| id)
    }

    /// Drop the inventory of a drawn-out or expired lot and free its tank.
    /// A tank with a cleanout starts cleaning; otherwise waiters wake now.
    pub(crate) fn retire_inventory(&mut self, lot: LotId) {
        let Some(inv_id) = self.inventory_of(lot) else {
            return;
        };
        let Some(inventory) = self.inventories.remove(inv_id) else {
            return;
        };
        let area = inventory.storage;
        let now = self.clock;
        let cleanout = self.areas.get_mut(area).and_then(|a| a.release(inv_id, now));
        match cleanout {
            Some(until) => {
                debug!(until, "tank cleanout started");
                self.schedule(until, Event::CleanoutRetry { area });
            }
            None => {
                self.wake(WaitKey::Area(area));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Queue the initial events of a run, and re-derive the wake-ups of
    /// committed state (used after restoring a snapshot).
    pub(crate) fn seed(&mut self) {
        self.seeded = true;
        let now = self.clock;

        let order = self.activity_order.clone();
        for id in order {
            let Some(activity) = self.activities.get_mut(id) else {
                continue;
            };
            if let ActivityState::Waiting(_) = activity.state {
                activity.state = ActivityState::Pending;
            }
            if activity.state == ActivityState::Pending {
                let tick = activity.release.max(now);
                self.schedule(tick, Event::AttemptReservation { activity: id });
            }
        }

        let mut lot_events = Vec::new();
        for (id, lot) in self.lots() {
            if lot.is_expired() || lot.is_consumed() {
                continue;
            }
            for tick in lot.transfer.release_ticks(lot.flow) {
                if tick > now {
                    lot_events.push((tick, Event::MaterialAvailable { lot: id }));
                }
            }
            if let Some(tick) = lot.expires_at {
                lot_events.push((tick, Event::ShelfLifeExpired { lot: id }));
            }
        }

        let mut area_events = Vec::new();
        for (area_id, area) in &self.areas {
            let mut ends: Vec<Ticks> = area
                .ledger
                .usages()
                .iter()
                .map(|u| u.window.end)
                .filter(|&end| end > now)
                .collect();
            ends.sort_unstable();
            ends.dedup();
            area_events.extend(ends.into_iter().map(|t| (t, Event::UsageExpired { area: area_id })));
            if let Some(crate::storage::TankState::Cleaning { until }) = area.tank {
                area_events.push((until, Event::CleanoutRetry { area: area_id }));
            }
        }

        let batch_events: Vec<(Ticks, Event)> = self
            .batches
            .iter()
            .filter(|(_, b)| {
                b.times.processing_end > now
                    && self
                        .resources
                        .get(b.resource)
                        .is_some_and(|r| r.kind.is_multitasking())
            })
            .map(|(id, b)| (b.times.processing_end, Event::BlockFinished { batch: id }))
            .collect();

        for (tick, event) in lot_events.into_iter().chain(area_events).chain(batch_events) {
            self.schedule(tick, event);
        }
        self.schedule(self.horizon, Event::PlanningHorizonReached);
        debug!(pending = self.queue.len(), "run seeded");
    }

    /// Run to the configured planning horizon.
    pub fn run(&mut self) -> RunReport {
        self.run_to(self.horizon)
    }

    /// Dispatch events up to and including `horizon`. A halted kernel
    /// resumes from where it stopped.
    #[tracing::instrument(skip(self))]
    pub fn run_to(&mut self, horizon: Ticks) -> RunReport {
        if !self.seeded {
            self.horizon = horizon;
            self.seed();
        } else if horizon != self.horizon {
            self.horizon = horizon;
            self.schedule(horizon, Event::PlanningHorizonReached);
        }
        self.state = RunState::Running;
        info!(
            clock = self.clock,
            horizon = self.horizon,
            pending = self.queue.len(),
            "run started"
        );

        let mut dispatched = 0u64;
        let outcome = loop {
            if let Some(limit) = self.config.max_dispatches {
                if self.dispatched_total >= limit {
                    break RunOutcome::Failed(format!("dispatch limit of {limit} reached"));
                }
            }
            if self.queue.pending_work() == 0 {
                break RunOutcome::Exhausted;
            }
            match self.queue.peek() {
                Some(next) if next.tick > self.horizon => break RunOutcome::Horizon,
                Some(_) => {}
                None => break RunOutcome::Exhausted,
            }
            let event = match self.queue.pop_earliest() {
                Ok(event) => event,
                Err(err) => break RunOutcome::Failed(err.to_string()),
            };
            self.clock = self.clock.max(event.tick);
            dispatched += 1;
            self.dispatched_total += 1;

            match self.dispatch(event) {
                Ok(Dispatch::Handled { stale }) => self.record(&event, stale),
                Ok(Dispatch::Halt) => {
                    self.record(&event, false);
                    break RunOutcome::Horizon;
                }
                Err(err) => {
                    warn!(tick = event.tick, kind = %event.kind(), error = %err, "handler failed");
                    self.record(&event, false);
                    break RunOutcome::Failed(err.to_string());
                }
            }
        };

        self.state = match outcome {
            RunOutcome::Exhausted => RunState::Idle,
            _ => RunState::Halted,
        };
        if outcome == RunOutcome::Exhausted {
            self.give_up_open_activities();
        }
        let unplaced = self.unplaced();
        for (key, reason) in &unplaced {
            warn!(activity = %key, reason = %reason, "activity unplaced");
        }
        info!(
            outcome = %outcome,
            dispatched,
            clock = self.clock,
            unplaced = unplaced.len(),
            "run finished"
        );
        RunReport {
            outcome,
            dispatched,
            clock: self.clock,
            unplaced,
        }
    }

    fn record(&mut self, event: &ScheduledEvent, stale: bool) {
        self.log.push(DispatchRecord {
            tick: event.tick,
            kind: event.kind(),
            seq: event.seq,
            stale,
        });
    }

    /// With the queue exhausted nothing can wake an open activity again.
    fn give_up_open_activities(&mut self) {
        let order = self.activity_order.clone();
        for id in order {
            let Some(activity) = self.activities.get_mut(id) else {
                continue;
            };
            if activity.is_open() {
                let reason = self
                    .last_failure
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| "not attempted".to_string());
                activity.state = ActivityState::Unplaceable(reason);
            }
        }
        self.waiters.clear();
    }

    /// Reset run-scoped state: lot accounting, reservations, usages, tanks
    /// and placements. Produced lots are dropped; supplied lots go back to
    /// their areas.
    pub fn reset_run(&mut self) -> Result<(), KernelError> {
        if self.state == RunState::Running {
            return Err(KernelError::Running);
        }
        self.queue.clear();
        self.log.clear();
        self.state = RunState::Idle;
        self.clock = 0;
        self.horizon = self.config.planning_horizon;
        self.extensions_used = 0;
        self.seeded = false;
        self.dispatched_total = 0;

        self.blocks.clear();
        self.batches.clear();
        self.placements.clear();
        self.waiters.clear();
        self.last_failure.clear();
        for resource in self.resources.values_mut() {
            resource.book.clear();
        }
        for area in self.areas.values_mut() {
            area.reset();
        }
        for connector in self.connectors.values_mut() {
            connector.ledger.clear();
        }

        self.lots.retain(|_, lot| lot.producer.is_none());
        let lots = &self.lots;
        self.lot_order.retain(|id| lots.contains_key(*id));
        for lot in self.lots.values_mut() {
            lot.reset();
        }
        self.inventories.clear();
        let stored: Vec<(LotId, StorageAreaId)> = self
            .lots()
            .filter_map(|(id, lot)| lot.location.map(|area| (id, area)))
            .collect();
        for (lot, area) in stored {
            self.store(lot, area)?;
        }

        for activity in self.activities.values_mut() {
            activity.reset();
        }
        debug!("run state reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, scheduled: ScheduledEvent) -> Result<Dispatch, KernelError> {
        let tick = scheduled.tick;
        debug!(tick, seq = scheduled.seq, kind = %scheduled.kind(), "dispatch");
        let stale = match scheduled.event {
            Event::ShelfLifeExpired { lot } => self.on_shelf_life_expired(lot, tick),
            Event::UsageExpired { area } => self.on_usage_expired(area),
            Event::BlockFinished { batch } => self.wake(WaitKey::Batch(batch)) == 0,
            Event::CleanoutRetry { area } => self.on_cleanout(area),
            Event::ConnectorRetry { connector, activity } => {
                let now = self.clock;
                if let Some(c) = self.connectors.get_mut(connector) {
                    c.ledger.expire(now);
                }
                let live = self.is_waiting_on(activity, |reason| {
                    matches!(*reason, WaitReason::Connector { connector: c, until } if c == connector && until == tick)
                });
                if live {
                    self.attempt_placement(activity)?;
                }
                !live
            }
            Event::MaterialAvailable { lot } => match self.lots.get(lot) {
                Some(l) if !l.is_expired() => self.wake(WaitKey::Material(l.material)) == 0,
                _ => true,
            },
            Event::RetryResourceUsage { resource, activity } => {
                let live = self.is_waiting_on(activity, |reason| {
                    matches!(*reason, WaitReason::Resource { resource: r, until } if r == resource && until == tick)
                });
                if live {
                    self.attempt_placement(activity)?;
                }
                !live
            }
            Event::AttemptReservation { activity } => {
                let live = self
                    .activities
                    .get(activity)
                    .is_some_and(|a| a.state == ActivityState::Pending);
                if live {
                    self.attempt_placement(activity)?;
                }
                !live
            }
            Event::PlanningHorizonReached => return Ok(self.on_horizon(tick)),
        };
        if stale {
            trace!(tick, kind = %scheduled.kind(), "stale event skipped");
        }
        Ok(Dispatch::Handled { stale })
    }

    fn is_waiting_on(&self, id: ActivityId, pred: impl Fn(&WaitReason) -> bool) -> bool {
        self.activities.get(id).is_some_and(|a| match &a.state {
            ActivityState::Waiting(reason) => pred(reason),
            _ => false,
        })
    }

    /// Purge a lot whose shelf life ran out. Returns whether the event was
    /// stale.
    fn on_shelf_life_expired(&mut self, lot_id: LotId, tick: Ticks) -> bool {
        let Some(lot) = self.lots.get_mut(lot_id) else {
            return true;
        };
        if lot.expired || lot.is_consumed() || lot.expires_at.is_none_or(|e| e > tick) {
            return true;
        }
        lot.expired = true;
        info!(lot = %lot.code, remaining = %lot.remaining(), "shelf life expired, lot purged");
        self.retire_inventory(lot_id);
        false
    }

    fn on_usage_expired(&mut self, area: StorageAreaId) -> bool {
        let now = self.clock;
        let pruned = self
            .areas
            .get_mut(area)
            .map(|a| a.ledger.expire(now))
            .unwrap_or(0);
        let woken = self.wake(WaitKey::Area(area));
        pruned == 0 && woken == 0
    }

    fn on_cleanout(&mut self, area: StorageAreaId) -> bool {
        let now = self.clock;
        let finished = self
            .areas
            .get_mut(area)
            .is_some_and(|a| a.finish_cleanout(now));
        if !finished {
            return true;
        }
        debug!(tick = now, "tank cleanout finished");
        self.wake(WaitKey::Area(area));
        false
    }

    fn on_horizon(&mut self, tick: Ticks) -> Dispatch {
        if tick != self.horizon {
            // A marker for a horizon that has since moved.
            return Dispatch::Handled { stale: true };
        }
        if let Some(extension) = self.config.horizon_extension {
            if self.extensions_used < self.config.max_horizon_extensions && self.queue.pending_work() > 0 {
                self.extensions_used += 1;
                self.horizon = self.horizon.saturating_add(extension);
                info!(
                    horizon = self.horizon,
                    extension = self.extensions_used,
                    "planning horizon extended"
                );
                self.schedule(self.horizon, Event::PlanningHorizonReached);
                return Dispatch::Handled { stale: false };
            }
        }
        info!(tick, pending = self.queue.pending_work(), "planning horizon reached");
        Dispatch::Halt
    }
}

// ---------------------------------------------------------------------------
// Batch runs
// ---------------------------------------------------------------------------

/// Run independent kernels to their horizons. With the `parallel` feature
/// the kernels run on the rayon thread pool; results keep input order.
pub fn run_scenarios(kernels: Vec<Kernel>) -> Vec<(Kernel, RunReport)> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        kernels
            .into_par_iter()
            .map(|mut kernel| {
                let report = kernel.run();
                (kernel, report)
            })
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        kernels
            .into_iter()
            .map(|mut kernel| {
                let report = kernel.run();
                (kernel, report)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::test_utils::*;
    use crate::time::Window;

    #[test]
    fn conflicting_reservation_retries_at_next_free_tick() {
        let (mut k, r) = kernel_with_single_resource("R");
        k.add_activity(run_on(key(1, 1, 10), r, 100).released_at(100)).unwrap();
        k.add_activity(run_on(key(1, 1, 20), r, 100).released_at(150)).unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 1, 20)).unwrap().start, 200);
        assert_eq!(windows_of(&k, r), vec![Window::new(100, 200), Window::new(200, 300)]);
        assert!(dispatched_kinds(&k).contains(&EventKind::RetryResourceUsage));
        let second = k.find_activity(key(1, 1, 20)).unwrap();
        assert_eq!(k.activity(second).unwrap().attempts(), 2);
    }

    #[test]
    fn saturated_area_waits_for_usage_expiry() {
        let (mut k, m, area, _) = kernel_with_stock(MaterialDef::new("paint"), 10, 100);
        let r1 = k.add_resource(Resource::single("r1"));
        let r2 = k.add_resource(Resource::single("r2"));
        k.add_activity(run_on(key(1, 1, 10), r1, 50).consumes(MaterialRequirement::new(m, units(6)).from_area(area)))
            .unwrap();
        k.add_activity(
            run_on(key(1, 2, 10), r2, 20)
                .released_at(10)
                .consumes(MaterialRequirement::new(m, units(5)).from_area(area)),
        )
        .unwrap();

        k.run_to(49);
        assert_eq!(
            state_of(&k, key(1, 2, 10)),
            Some(ActivityState::Waiting(WaitReason::StorageArea(area)))
        );

        let report = k.run_to(1_000);
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 2, 10)).unwrap().start, 50);
    }

    #[test]
    fn shelf_life_purges_lot_regardless_of_remaining_quantity() {
        let (mut k, m, _, lot) = kernel_with_stock(MaterialDef::new("yeast").with_shelf_life(1000), 1000, 100);
        let r = k.add_resource(Resource::single("mixer"));
        k.add_activity(
            run_on(key(1, 1, 10), r, 1)
                .released_at(999)
                .consumes(MaterialRequirement::new(m, units(40))),
        )
        .unwrap();

        let first = k.run_to(999);
        assert_eq!(first.outcome, RunOutcome::Horizon);
        assert_eq!(*k.run_state(), RunState::Halted);
        let l = k.lot(lot).unwrap();
        assert_eq!(l.consumed(), units(40));
        assert_eq!(l.available_at(999), units(60));
        assert_eq!(k.inventories().count(), 1);

        let second = k.run_to(2_000);
        assert_eq!(second.outcome, RunOutcome::Exhausted);
        let l = k.lot(lot).unwrap();
        assert!(l.is_expired());
        assert_eq!(l.remaining(), units(60));
        assert_eq!(k.inventories().count(), 0);
    }

    fn tie_break_kernel() -> Kernel {
        let (mut k, m, area, _) = kernel_with_stock(MaterialDef::new("resin"), 100, 100);
        let oven = k.add_resource(Resource::multitasking("oven", 2));
        k.add_activity(run_on(key(1, 1, 10), oven, 500).consumes(MaterialRequirement::new(m, units(1)).from_area(area)))
            .unwrap();
        k
    }

    #[test]
    fn same_tick_events_dispatch_by_type_id() {
        let mut k = tie_break_kernel();
        k.run();
        let at_500: Vec<EventKind> = k
            .dispatch_log()
            .iter()
            .filter(|r| r.tick == 500)
            .map(|r| r.kind)
            .collect();
        assert_eq!(at_500, vec![EventKind::UsageExpired, EventKind::BlockFinished]);

        let mut again = tie_break_kernel();
        again.run();
        let a: Vec<_> = k.dispatch_log().iter().copied().collect();
        let b: Vec<_> = again.dispatch_log().iter().copied().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn multitasking_batch_fills_then_parks() {
        let mut k = Kernel::default();
        let oven = k.add_resource(Resource::multitasking("oven", 2));
        for op in [10, 20, 30] {
            k.add_activity(run_on(key(1, op, 10), oven, 20)).unwrap();
        }
        k.run();

        assert_eq!(placed_times(&k, key(1, 10, 10)).unwrap().start, 0);
        assert_eq!(placed_times(&k, key(1, 20, 10)).unwrap().start, 0);
        assert_eq!(placed_times(&k, key(1, 30, 10)).unwrap().start, 20);
        let (_, first) = k.blocks().next().unwrap();
        assert_eq!(k.batch(first.batch).unwrap().len(), 2);
        assert_eq!(windows_of(&k, oven), vec![Window::new(0, 20), Window::new(20, 40)]);
    }

    #[test]
    fn tank_cleanout_delays_next_inventory() {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("syrup"));
        let tank = k.add_area(StorageArea::tank("tank", units(100), 5));
        let r1 = k.add_resource(Resource::single("r1"));
        let r2 = k.add_resource(Resource::single("r2"));
        let r3 = k.add_resource(Resource::single("r3"));
        k.add_activity(run_on(key(1, 1, 10), r1, 10).produces(OutputSpec::new(m, units(10)).into_area(tank)))
            .unwrap();
        k.add_activity(run_on(key(1, 1, 20), r2, 5).consumes(MaterialRequirement::new(m, units(10)).from_area(tank)))
            .unwrap();
        k.add_activity(run_on(key(2, 1, 10), r3, 10).produces(OutputSpec::new(m, units(10)).into_area(tank)))
            .unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 1, 20)).unwrap().start, 10);
        assert_eq!(placed_times(&k, key(2, 1, 10)).unwrap().start, 15);
        assert!(dispatched_kinds(&k).contains(&EventKind::CleanoutRetry));
    }

    #[test]
    fn missing_material_leaves_activity_unplaced() {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("salt"));
        let r = k.add_resource(Resource::single("r"));
        k.add_activity(run_on(key(3, 1, 10), r, 5).consumes(MaterialRequirement::new(m, units(1))))
            .unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(report.unplaced.len(), 1);
        assert!(report.unplaced[0].1.contains("salt"));
        assert!(matches!(state_of(&k, key(3, 1, 10)), Some(ActivityState::Unplaceable(_))));
    }

    #[test]
    fn planned_receipt_wakes_its_consumer() {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("flour"));
        k.add_lot(Lot::on_hand("RCPT", m, units(10), 100)).unwrap();
        let r = k.add_resource(Resource::single("r"));
        k.add_activity(run_on(key(1, 1, 10), r, 5).consumes(MaterialRequirement::new(m, units(5))))
            .unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert!(report.unplaced.is_empty());
        assert_eq!(placed_times(&k, key(1, 1, 10)).unwrap().start, 100);
        assert!(dispatched_kinds(&k).contains(&EventKind::MaterialAvailable));
    }

    #[test]
    fn receipt_added_mid_run_wakes_its_consumer() {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("flour"));
        let r1 = k.add_resource(Resource::single("r1"));
        let r2 = k.add_resource(Resource::single("r2"));
        k.add_activity(run_on(key(1, 1, 10), r1, 5).consumes(MaterialRequirement::new(m, units(5))))
            .unwrap();
        k.add_activity(run_on(key(2, 1, 10), r2, 5).released_at(200)).unwrap();

        assert_eq!(k.run_to(50).outcome, RunOutcome::Horizon);
        assert_eq!(
            state_of(&k, key(1, 1, 10)),
            Some(ActivityState::Waiting(WaitReason::Material(m)))
        );

        k.add_lot(Lot::on_hand("RCPT", m, units(10), 80)).unwrap();
        let report = k.run_to(300);
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 1, 10)).unwrap().start, 80);
        assert_eq!(placed_times(&k, key(2, 1, 10)).unwrap().start, 200);
    }

    #[test]
    fn saturated_connector_retries_at_next_free_tick() {
        let (mut k, m, area, lot) = kernel_with_stock(MaterialDef::new("oil"), 1000, 100);
        let pipe = k
            .add_connector(StorageAreaConnector::new("pipe", Some(area), None, units(10)))
            .unwrap();
        let r1 = k.add_resource(Resource::single("r1"));
        let r2 = k.add_resource(Resource::single("r2"));
        let first = k
            .add_activity(run_on(key(1, 1, 10), r1, 30).consumes(MaterialRequirement::new(m, units(8)).from_area(area).through(pipe)))
            .unwrap();
        k.add_activity(run_on(key(1, 2, 10), r2, 30).consumes(MaterialRequirement::new(m, units(8)).from_area(area).through(pipe)))
            .unwrap();

        k.run_to(20);
        assert_eq!(
            state_of(&k, key(1, 2, 10)),
            Some(ActivityState::Waiting(WaitReason::Connector { connector: pipe, until: 30 }))
        );

        let report = k.run_to(1_000);
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 2, 10)).unwrap().start, 30);
        assert!(dispatched_kinds(&k).contains(&EventKind::ConnectorRetry));
        assert_eq!(k.lot(lot).unwrap().consumed(), units(16));
        // The first usage closed when the retry fired.
        let usages = k.connector(pipe).unwrap().ledger.usages();
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].window, Window::new(30, 60));

        // Undo still works once the placement's usages have expired.
        k.unschedule(first, crate::placement::UndoFlags::default()).unwrap();
        assert_eq!(k.lot(lot).unwrap().consumed(), units(8));
    }

    #[test]
    fn incremental_transfer_feeds_consumer_before_producer_finishes() {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("dough").with_transfer(TransferPolicy::Incremental { step: 10 }));
        let r1 = k.add_resource(Resource::single("r1"));
        let r2 = k.add_resource(Resource::single("r2"));
        k.add_activity(run_on(key(1, 1, 10), r1, 40).produces(OutputSpec::new(m, units(40))))
            .unwrap();
        k.add_activity(run_on(key(1, 1, 20), r2, 5).consumes(MaterialRequirement::new(m, units(10))))
            .unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        let producer = placed_times(&k, key(1, 1, 10)).unwrap();
        let consumer = placed_times(&k, key(1, 1, 20)).unwrap();
        assert_eq!(consumer.start, 10);
        assert!(consumer.start < producer.processing_end);
        let (_, produced) = k.lots().next().unwrap();
        assert_eq!(produced.consumed(), units(10));
    }

    #[test]
    fn undo_wakes_resource_waiter_before_its_retry_tick() {
        let (mut k, r) = kernel_with_single_resource("r");
        let long = k.add_activity(run_on(key(1, 1, 10), r, 100)).unwrap();
        k.add_activity(run_on(key(1, 2, 10), r, 20).released_at(10)).unwrap();

        assert_eq!(k.run_to(50).outcome, RunOutcome::Horizon);
        assert_eq!(
            state_of(&k, key(1, 2, 10)),
            Some(ActivityState::Waiting(WaitReason::Resource { resource: r, until: 100 }))
        );

        let flags = crate::placement::UndoFlags {
            retry_after_undo: false,
            wake_dependents: true,
        };
        k.unschedule(long, flags).unwrap();
        k.run_to(300);
        assert_eq!(placed_times(&k, key(1, 2, 10)).unwrap().start, 50);
        assert_eq!(windows_of(&k, r), vec![Window::new(50, 70)]);
    }

    #[test]
    fn horizon_halts_and_resume_continues() {
        let mut k = Kernel::new(KernelConfig::with_horizon(50));
        let r = k.add_resource(Resource::single("r"));
        k.add_activity(run_on(key(1, 1, 10), r, 10).released_at(120)).unwrap();

        let first = k.run();
        assert_eq!(first.outcome, RunOutcome::Horizon);
        assert_eq!(first.clock, 50);
        assert!(placed_times(&k, key(1, 1, 10)).is_none());

        let second = k.run_to(200);
        assert_eq!(second.outcome, RunOutcome::Exhausted);
        assert_eq!(placed_times(&k, key(1, 1, 10)).unwrap().start, 120);
    }

    #[test]
    fn horizon_extends_while_work_remains() {
        let config = KernelConfig {
            horizon_extension: Some(100),
            max_horizon_extensions: 1,
            ..KernelConfig::with_horizon(50)
        };
        let mut k = Kernel::new(config);
        let r = k.add_resource(Resource::single("r"));
        k.add_activity(run_on(key(1, 1, 10), r, 10).released_at(120)).unwrap();

        let report = k.run();
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        assert_eq!(k.horizon(), 150);
        assert!(placed_times(&k, key(1, 1, 10)).is_some());
    }

    #[test]
    fn dispatch_limit_fails_the_run() {
        let config = KernelConfig {
            max_dispatches: Some(1),
            ..KernelConfig::default()
        };
        let mut k = Kernel::new(config);
        let r = k.add_resource(Resource::single("r"));
        k.add_activity(run_on(key(1, 1, 10), r, 10)).unwrap();
        k.add_activity(run_on(key(1, 1, 20), r, 10)).unwrap();

        let report = k.run();
        assert!(report.outcome.is_failed());
        assert_eq!(report.dispatched, 1);
        assert_eq!(*k.run_state(), RunState::Halted);
    }

    #[test]
    fn reset_run_reproduces_the_same_schedule() {
        let mut k = build_chain_scenario(5);
        k.run();
        let first = k.state_hash();
        let lots_after_first = k.lots().count();

        k.reset_run().unwrap();
        assert_eq!(k.clock(), 0);
        assert_eq!(k.blocks().count(), 0);
        assert_eq!(k.lots().count(), 0);
        assert!(k.resources().all(|(_, r)| r.book().is_empty()));

        k.run();
        assert_eq!(k.state_hash(), first);
        assert_eq!(k.lots().count(), lots_after_first);
    }

    #[test]
    fn identical_inputs_give_identical_hashes() {
        let mut a = build_contended_scenario(40, 3);
        let mut b = build_contended_scenario(40, 3);
        a.run();
        b.run();
        assert_eq!(a.state_hash(), b.state_hash());
        assert!(books_consistent(&a));
    }

    #[test]
    fn duplicate_activity_key_is_rejected() {
        let (mut k, r) = kernel_with_single_resource("r");
        k.add_activity(run_on(key(1, 1, 10), r, 5)).unwrap();
        let err = k.add_activity(run_on(key(1, 1, 10), r, 7)).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateActivity(_)));
    }

    #[test]
    fn lot_of_unknown_material_is_rejected() {
        let mut k = Kernel::default();
        let err = k.add_lot(Lot::on_hand("L", MaterialId(9), units(1), 0)).unwrap_err();
        assert!(matches!(err, KernelError::UnknownMaterial(MaterialId(9))));
    }

    #[test]
    fn past_ticks_are_clamped_to_the_clock() {
        let mut k = Kernel::default();
        k.clock = 100;
        k.schedule(40, Event::PlanningHorizonReached);
        assert_eq!(k.queue.peek().unwrap().tick, 100);
    }

    #[test]
    fn activity_added_after_a_run_is_attempted_on_resume() {
        let (mut k, r) = kernel_with_single_resource("r");
        k.add_activity(run_on(key(1, 1, 10), r, 10)).unwrap();
        k.run();
        k.add_activity(run_on(key(1, 1, 20), r, 10)).unwrap();
        k.run();
        assert_eq!(placed_times(&k, key(1, 1, 20)).unwrap().start, 10);
    }

    #[test]
    fn scenarios_run_independently() {
        let kernels = vec![build_contended_scenario(10, 2), build_chain_scenario(3)];
        let results = run_scenarios(kernels);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.outcome == RunOutcome::Exhausted));
        assert_eq!(results[1].0.blocks().count(), 3);
    }
}
