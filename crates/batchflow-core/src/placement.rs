//! Placement attempts and their undo.
//!
//! An attempt plans every demand of an activity against current state
//! (materials, then resources, then storage and connectors) without
//! touching anything. Only when the whole plan fits is it committed. A
//! failed plan parks the activity on the first blocker found.

use crate::activity::{Activity, ActivityState, OpenUsage, OutputSpec, Placement, UsageTarget, WaitReason};
use crate::block::{Batch, Block, BlockTimes};
use crate::event::Event;
use crate::fixed::{Quantity, Ticks};
use crate::id::*;
use crate::kernel::{Kernel, KernelError, WaitKey};
use crate::material::{plan_draws, Draw, EligibilityContext, Lot, MaterialError};
use crate::reservation::{ReservationError, ResourceKind};
use crate::storage::{Flow, StorageError, TankState, Usage, UsageLedger};
use crate::time::Window;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Resource slot chosen for one requirement.
#[derive(Debug, Clone, Copy)]
enum Slot {
    /// Reserve a new window.
    Fresh(Window),
    /// Join an existing multitasking batch.
    Join(BatchId),
}

#[derive(Debug)]
struct Plan {
    times: BlockTimes,
    draws: Vec<Draw>,
    slots: Vec<(usize, ResourceId, Slot)>,
    usages: Vec<OpenUsage>,
}

/// Why a plan failed, and what should wake the activity.
#[derive(Debug)]
struct Blocked {
    /// `None` when nothing can ever satisfy the demand.
    wait: Option<WaitReason>,
    reason: String,
}

impl Blocked {
    fn wait(wait: WaitReason, reason: String) -> Self {
        Self {
            wait: Some(wait),
            reason,
        }
    }

    fn never(reason: String) -> Self {
        Self { wait: None, reason }
    }
}

/// Options for [`Kernel::unschedule`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoFlags {
    /// Queue a new placement attempt for the released activity.
    pub retry_after_undo: bool,
    /// Wake activities waiting on anything the placement held.
    pub wake_dependents: bool,
}

impl UndoFlags {
    pub fn retry_and_wake() -> Self {
        Self {
            retry_after_undo: true,
            wake_dependents: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    #[error("unknown activity")]
    UnknownActivity,
    #[error("activity {0} is not placed")]
    NotPlaced(ActivityKey),
    #[error("output of activity {0} has already been drawn")]
    OutputDrawn(ActivityKey),
    #[error("tank holding a lot drawn by activity {0} has been reused")]
    TankReused(ActivityKey),
    #[error("the kernel is running")]
    Running,
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Material(#[from] MaterialError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl Kernel {
    /// Lots in FIFO draw order: earliest production first, then creation
    /// order.
    fn fifo_lots(&self) -> Vec<LotId> {
        let mut order = self.lot_order.clone();
        order.sort_by_key(|id| self.lots.get(*id).map_or(Ticks::MAX, |l| l.produced_at));
        order
    }

    /// Try to place an activity at the current tick. A failure parks it.
    pub(crate) fn attempt_placement(&mut self, id: ActivityId) -> Result<(), KernelError> {
        let activity = self.activities.get_mut(id).ok_or(KernelError::UnknownActivity)?;
        if !activity.is_open() {
            return Ok(());
        }
        activity.attempts += 1;
        let activity = activity.clone();
        let start = self.clock.max(activity.release);
        let times = BlockTimes::from_spans(start, &activity.spans);

        match self.plan(id, &activity, times)? {
            Ok(plan) => self.commit(id, &activity, plan),
            Err(blocked) => {
                debug!(
                    activity = %activity.key,
                    tick = self.clock,
                    attempt = activity.attempts,
                    reason = %blocked.reason,
                    "placement blocked"
                );
                self.last_failure.insert(id, blocked.reason.clone());
                match blocked.wait {
                    Some(wait) => self.park(id, wait),
                    None => {
                        if let Some(a) = self.activities.get_mut(id) {
                            a.state = ActivityState::Unplaceable(blocked.reason);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn plan(
        &self,
        id: ActivityId,
        activity: &Activity,
        times: BlockTimes,
    ) -> Result<Result<Plan, Blocked>, KernelError> {
        let draws = match self.plan_materials(activity, times)? {
            Ok(draws) => draws,
            Err(blocked) => return Ok(Err(blocked)),
        };
        let slots = match self.plan_resources(activity, times)? {
            Ok(slots) => slots,
            Err(blocked) => return Ok(Err(blocked)),
        };
        let usages = match self.plan_usages(id, activity, times)? {
            Ok(usages) => usages,
            Err(blocked) => return Ok(Err(blocked)),
        };
        Ok(Ok(Plan {
            times,
            draws,
            slots,
            usages,
        }))
    }

    fn plan_materials(
        &self,
        activity: &Activity,
        times: BlockTimes,
    ) -> Result<Result<Vec<Draw>, Blocked>, KernelError> {
        let ctx = EligibilityContext {
            tick: self.clock,
            needed_until: times.processing_end,
        };
        let order = self.fifo_lots();
        let mut planned = BTreeMap::new();
        let mut draws = Vec::new();
        for req in &activity.materials {
            let def = self.material(req.material)?;
            match plan_draws(&self.lots, &order, req, &ctx, &mut planned)? {
                Some(found) => draws.extend(found),
                None => {
                    let reason = format!("material {} short of {}", def.name, req.quantity);
                    return Ok(Err(Blocked::wait(WaitReason::Material(req.material), reason)));
                }
            }
        }
        Ok(Ok(draws))
    }

    fn plan_resources(
        &self,
        activity: &Activity,
        times: BlockTimes,
    ) -> Result<Result<Vec<(usize, ResourceId, Slot)>, Blocked>, KernelError> {
        let mut slots: Vec<(usize, ResourceId, Slot)> = Vec::new();
        for (index, req) in activity.resources.iter().enumerate() {
            let mut chosen = None;
            // Earliest retry over all candidates, and the earliest
            // multitasking batch blocking one of them.
            let mut retry: Option<(Ticks, ResourceId)> = None;
            let mut blocking: Option<(Ticks, BatchId)> = None;

            for &rid in &req.candidates {
                if slots.iter().any(|(_, used, _)| *used == rid) {
                    continue;
                }
                let resource = self.resources.get(rid).ok_or(KernelError::UnknownResource)?;
                let window = resource.kind.occupied_window(&times);
                if let ResourceKind::Multitasking { capacity } = resource.kind {
                    if let Some(batch) = resource.book.owner_at(window.start) {
                        if self.batches.get(batch).is_some_and(|b| b.can_join(&times, capacity)) {
                            chosen = Some((rid, Slot::Join(batch)));
                            break;
                        }
                    }
                }
                let Some(conflict) = resource.book.first_conflict(window) else {
                    chosen = Some((rid, Slot::Fresh(window)));
                    break;
                };
                if resource.kind.is_multitasking() {
                    if let Some(batch) = resource.book.owner_at(conflict.start) {
                        if blocking.is_none_or(|(end, _)| conflict.end < end) {
                            blocking = Some((conflict.end, batch));
                        }
                    }
                }
                let next = resource.book.next_free(window);
                if retry.is_none_or(|(t, _)| next < t) {
                    retry = Some((next, rid));
                }
            }

            match chosen {
                Some((rid, slot)) => slots.push((index, rid, slot)),
                None => {
                    let blocked = match (blocking, retry) {
                        (Some((end, batch)), retry) if retry.is_none_or(|(t, _)| end <= t) => Blocked::wait(
                            WaitReason::Batch(batch),
                            format!("resource requirement {index} busy with a batch until {end}"),
                        ),
                        (_, Some((until, resource))) => Blocked::wait(
                            WaitReason::Resource { resource, until },
                            format!("resource requirement {index} busy until {until}"),
                        ),
                        _ => Blocked::never(format!(
                            "resource requirement {index} has no candidate left after other requirements"
                        )),
                    };
                    return Ok(Err(blocked));
                }
            }
        }
        Ok(Ok(slots))
    }

    fn plan_usages(
        &self,
        id: ActivityId,
        activity: &Activity,
        times: BlockTimes,
    ) -> Result<Result<Vec<OpenUsage>, Blocked>, KernelError> {
        let mut wanted: Vec<(UsageTarget, Flow, Quantity)> = Vec::new();
        for req in &activity.materials {
            if let Some(area) = req.source {
                wanted.push((UsageTarget::Area(area), Flow::Outflow, req.quantity));
            }
            if let Some(connector) = req.connector {
                wanted.push((UsageTarget::Connector(connector), Flow::Outflow, req.quantity));
            }
        }
        if let Some(out) = &activity.output {
            if let Some(area) = out.storage {
                let storage = self.areas.get(area).ok_or(KernelError::UnknownArea)?;
                if let Err(err) = storage.check_accepts_inventory() {
                    return Ok(Err(Blocked::wait(
                        WaitReason::StorageArea(area),
                        format!("storage {}: {err}", storage.name),
                    )));
                }
                wanted.push((UsageTarget::Area(area), Flow::Inflow, out.quantity));
            }
            if let Some(connector) = out.connector {
                wanted.push((UsageTarget::Connector(connector), Flow::Inflow, out.quantity));
            }
        }

        let run = times.run_window();
        let mut scratch: BTreeMap<UsageTarget, UsageLedger> = BTreeMap::new();
        let mut usages = Vec::new();
        for (target, flow, quantity) in wanted {
            let committed = self.ledger(target)?;
            let ledger = scratch.entry(target).or_insert_with(|| committed.clone());
            let usage = Usage {
                window: run,
                quantity,
                flow,
                activity: id,
            };
            match ledger.try_open(usage.clone()) {
                Ok(()) => usages.push(OpenUsage { target, usage }),
                Err(StorageError::Saturated { next_free, .. }) if committed.peak_load(run) > Quantity::ZERO => {
                    let reason = format!("{target:?} saturated over {run}");
                    let wait = match target {
                        UsageTarget::Area(area) => WaitReason::StorageArea(area),
                        UsageTarget::Connector(connector) => WaitReason::Connector {
                            connector,
                            until: next_free,
                        },
                    };
                    return Ok(Err(Blocked::wait(wait, reason)));
                }
                Err(err) => return Ok(Err(Blocked::never(format!("{target:?}: {err}")))),
            }
        }
        Ok(Ok(usages))
    }

    fn commit(&mut self, id: ActivityId, activity: &Activity, plan: Plan) -> Result<(), KernelError> {
        let now = self.clock;

        let mut emptied = Vec::new();
        for draw in &plan.draws {
            let lot = self.lots.get_mut(draw.lot).ok_or(MaterialError::UnknownLot)?;
            lot.consume(draw.quantity, now)?;
            if lot.is_consumed() && !emptied.contains(&draw.lot) {
                emptied.push(draw.lot);
            }
        }
        for &lot in &emptied {
            self.retire_inventory(lot);
        }

        let mut blocks = Vec::with_capacity(plan.slots.len());
        let mut assigned = Vec::with_capacity(plan.slots.len());
        for &(index, rid, slot) in &plan.slots {
            let resource = self.resources.get_mut(rid).ok_or(KernelError::UnknownResource)?;
            let kind = resource.kind;
            let (batch_id, window) = match slot {
                Slot::Fresh(window) => {
                    let batch_id = self.batches.insert(Batch::new(rid, plan.times, window));
                    if let Err(err) = resource.book.try_reserve(window, batch_id) {
                        self.batches.remove(batch_id);
                        return Err(err.into());
                    }
                    if kind.is_multitasking() {
                        self.schedule(plan.times.processing_end, Event::BlockFinished { batch: batch_id });
                    }
                    (batch_id, window)
                }
                Slot::Join(batch_id) => {
                    let window = self.batches.get(batch_id).ok_or(KernelError::UnknownBatch)?.window;
                    (batch_id, window)
                }
            };
            let block = self.blocks.insert(Block {
                activity: id,
                resource: rid,
                batch: batch_id,
                times: plan.times,
            });
            let mut incoming = Batch::new(rid, plan.times, window);
            incoming.blocks.push(block);
            let batch = self.batches.get_mut(batch_id).ok_or(KernelError::UnknownBatch)?;
            batch.absorb(&mut incoming, kind.batch_capacity())?;
            blocks.push(block);
            assigned.push((index, rid));
        }

        for open in &plan.usages {
            let ledger = self.ledger_mut(open.target)?;
            ledger.expire(now);
            ledger.try_open(open.usage.clone())?;
            if let UsageTarget::Area(area) = open.target {
                self.schedule(open.usage.window.end, Event::UsageExpired { area });
            }
        }

        let (output_lot, inventory) = match &activity.output {
            Some(out) => {
                let (lot, inventory) = self.produce(id, activity, out, &plan.times)?;
                (Some(lot), inventory)
            }
            None => (None, None),
        };

        if let Some(a) = self.activities.get_mut(id) {
            for (index, rid) in assigned {
                if let Some(req) = a.resources.get_mut(index) {
                    req.assigned = Some(rid);
                }
            }
            a.state = ActivityState::Placed;
        }
        self.last_failure.remove(id);
        debug!(
            activity = %activity.key,
            start = plan.times.start,
            end = plan.times.storage_end,
            blocks = blocks.len(),
            draws = plan.draws.len(),
            "activity placed"
        );
        self.placements.insert(
            id,
            Placement {
                times: plan.times,
                blocks,
                draws: plan.draws,
                usages: plan.usages,
                output_lot,
                inventory,
                emptied,
            },
        );
        Ok(())
    }

    /// Create the output lot of a placement and queue its events.
    fn produce(
        &mut self,
        id: ActivityId,
        activity: &Activity,
        out: &OutputSpec,
        times: &BlockTimes,
    ) -> Result<(LotId, Option<InventoryId>), KernelError> {
        let def = self.material(out.material)?;
        let transfer = def.transfer;
        let produced_at = times.processing_end;
        let expires_at = def.shelf_life.map(|s| produced_at.saturating_add(s));
        let flow = times.run_window();
        let lot = Lot {
            code: LotCode::new(format!("{}#{}", activity.key, activity.attempts)),
            material: out.material,
            total: out.quantity,
            consumed: Quantity::ZERO,
            uses: 0,
            produced_at,
            flow,
            transfer,
            expires_at,
            location: out.storage,
            tags: out.tags.clone(),
            producer: Some(id),
            expired: false,
        };
        let lot_id = self.lots.insert(lot);
        self.lot_order.push(lot_id);

        let inventory = match out.storage {
            Some(area) => Some(self.store(lot_id, area)?),
            None => None,
        };
        for tick in transfer.release_ticks(flow) {
            self.schedule(tick, Event::MaterialAvailable { lot: lot_id });
        }
        if let Some(tick) = expires_at {
            self.schedule(tick, Event::ShelfLifeExpired { lot: lot_id });
        }
        Ok((lot_id, inventory))
    }

    // -----------------------------------------------------------------------
    // Undo
    // -----------------------------------------------------------------------

    /// Roll back a committed placement: release its windows, close its
    /// usages, restore its draws and drop its output lot.
    ///
    /// Fails without changing anything when the output lot was already
    /// drawn by another placement, or a tank it emptied was refilled.
    pub fn unschedule(&mut self, id: ActivityId, flags: UndoFlags) -> Result<(), UndoError> {
        if self.state == crate::sim::RunState::Running {
            return Err(UndoError::Running);
        }
        let activity = self.activities.get(id).ok_or(UndoError::UnknownActivity)?;
        let key = activity.key;
        if !activity.is_placed() {
            return Err(UndoError::NotPlaced(key));
        }
        let placement = self.placements.get(id).cloned().ok_or(UndoError::NotPlaced(key))?;

        if let Some(lot) = placement.output_lot.and_then(|l| self.lots.get(l)) {
            if lot.consumed() > Quantity::ZERO || lot.uses() > 0 {
                return Err(UndoError::OutputDrawn(key));
            }
        }
        for &lot_id in &placement.emptied {
            let area = self.lots.get(lot_id).and_then(|l| l.location);
            let refilled = area
                .and_then(|a| self.areas.get(a))
                .is_some_and(|a| matches!(a.tank, Some(TankState::Holding(_))));
            if refilled {
                return Err(UndoError::TankReused(key));
            }
        }

        self.placements.remove(id);
        let now = self.clock;

        let mut freed_resources = BTreeSet::new();
        let mut freed_batches = Vec::new();
        for &block_id in &placement.blocks {
            let Some(block) = self.blocks.remove(block_id) else {
                continue;
            };
            freed_resources.insert(block.resource);
            let Some(batch) = self.batches.get_mut(block.batch) else {
                continue;
            };
            batch.remove_block(block_id);
            if batch.is_empty() {
                let window = batch.window;
                self.batches.remove(block.batch);
                if let Some(resource) = self.resources.get_mut(block.resource) {
                    resource.book.release(window, block.batch)?;
                }
                freed_batches.push(block.batch);
            }
        }

        let mut freed_areas = BTreeSet::new();
        let mut freed_connectors = BTreeSet::new();
        for open in &placement.usages {
            match self.ledger_mut(open.target)?.close(&open.usage) {
                Ok(()) => {}
                // Pruned when it expired.
                Err(StorageError::UnknownUsage) if open.usage.window.end <= now => {}
                Err(err) => return Err(err.into()),
            }
            match open.target {
                UsageTarget::Area(area) => freed_areas.insert(area),
                UsageTarget::Connector(connector) => freed_connectors.insert(connector),
            };
        }

        if let Some(lot_id) = placement.output_lot {
            if let Some(inv_id) = self.inventory_of(lot_id) {
                if let Some(inventory) = self.inventories.remove(inv_id) {
                    if let Some(area) = self.areas.get_mut(inventory.storage) {
                        if area.tank == Some(TankState::Holding(inv_id)) {
                            area.tank = Some(TankState::Empty);
                        }
                    }
                    freed_areas.insert(inventory.storage);
                }
            }
            self.lots.remove(lot_id);
            self.lot_order.retain(|l| *l != lot_id);
        }

        let mut materials = BTreeSet::new();
        for draw in placement.draws.iter().rev() {
            let lot = self.lots.get_mut(draw.lot).ok_or(MaterialError::UnknownLot)?;
            lot.restore(draw.quantity)?;
            materials.insert(lot.material);
        }
        for &lot_id in &placement.emptied {
            let Some(lot) = self.lots.get_mut(lot_id) else {
                continue;
            };
            if lot.expires_at.is_some_and(|e| e <= now) {
                lot.expired = true;
                continue;
            }
            let Some(area) = lot.location else {
                continue;
            };
            // A tank still cleaning after the draw takes the lot back.
            if let Some(storage) = self.areas.get_mut(area) {
                if matches!(storage.tank, Some(TankState::Cleaning { .. })) {
                    storage.tank = Some(TankState::Empty);
                }
            }
            self.store(lot_id, area)?;
        }

        if let Some(a) = self.activities.get_mut(id) {
            a.state = ActivityState::Pending;
            for req in &mut a.resources {
                req.assigned = None;
            }
        }
        debug!(activity = %key, tick = now, "placement undone");

        if flags.retry_after_undo {
            self.schedule(now, Event::AttemptReservation { activity: id });
        }
        if flags.wake_dependents {
            for batch in freed_batches {
                self.wake(WaitKey::Batch(batch));
            }
            for material in materials {
                self.wake(WaitKey::Material(material));
            }
            for &area in &freed_areas {
                self.wake(WaitKey::Area(area));
            }
            self.wake_retries(|reason| match *reason {
                WaitReason::Resource { resource, .. } => freed_resources.contains(&resource),
                WaitReason::Connector { connector, .. } => freed_connectors.contains(&connector),
                _ => false,
            });
        }
        Ok(())
    }
}
