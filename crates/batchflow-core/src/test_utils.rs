//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

pub use crate::activity::{Activity, ActivityState, OutputSpec, ResourceRequirement, WaitReason};
pub use crate::block::{BlockTimes, Spans};
pub use crate::fixed::{units, Quantity, Ticks};
pub use crate::id::*;
pub use crate::kernel::Kernel;
pub use crate::material::{Lot, MaterialDef, MaterialRequirement, TransferPolicy, Usability};
pub use crate::reservation::Resource;
pub use crate::sim::{KernelConfig, RunOutcome};
pub use crate::storage::{StorageArea, StorageAreaConnector};

use crate::event::EventKind;
use crate::time::Window;

// ===========================================================================
// Keys & activities
// ===========================================================================

pub fn key(job: u32, order: u32, operation: u32) -> ActivityKey {
    ActivityKey::new(job, order, operation)
}

/// An activity with only a run span, on one resource.
pub fn run_on(key: ActivityKey, resource: ResourceId, run: Ticks) -> Activity {
    Activity::new(key, format!("op-{key}"), Spans::run_only(run)).requires(ResourceRequirement::on(resource))
}

/// An activity with every span set, on one resource.
pub fn phased_on(key: ActivityKey, resource: ResourceId, spans: Spans) -> Activity {
    Activity::new(key, format!("op-{key}"), spans).requires(ResourceRequirement::on(resource))
}

// ===========================================================================
// Kernel builders
// ===========================================================================

pub fn kernel_with_single_resource(name: &str) -> (Kernel, ResourceId) {
    let mut k = Kernel::default();
    let r = k.add_resource(Resource::single(name));
    (k, r)
}

/// A kernel with one material and a plain area holding one supplied lot.
pub fn kernel_with_stock(
    material: MaterialDef,
    area_capacity: u32,
    lot_quantity: u32,
) -> (Kernel, MaterialId, StorageAreaId, LotId) {
    let mut k = Kernel::default();
    let m = k.add_material(material);
    let area = k.add_area(StorageArea::new("store", units(area_capacity)));
    let lot = k
        .add_lot(Lot::on_hand("L1", m, units(lot_quantity), 0).at(area))
        .expect("valid lot");
    (k, m, area, lot)
}

// ===========================================================================
// Inspection
// ===========================================================================

/// Block times of a placed activity.
pub fn placed_times(k: &Kernel, key: ActivityKey) -> Option<BlockTimes> {
    let id = k.find_activity(key)?;
    k.placement(id).map(|p| p.times)
}

pub fn state_of(k: &Kernel, key: ActivityKey) -> Option<ActivityState> {
    let id = k.find_activity(key)?;
    k.activity(id).map(|a| a.state().clone())
}

/// Reserved windows of a resource in start order.
pub fn windows_of(k: &Kernel, resource: ResourceId) -> Vec<Window> {
    k.resource(resource)
        .map(|r| r.book().iter().map(|(w, _)| w).collect())
        .unwrap_or_default()
}

/// Whether every resource book is pairwise disjoint.
pub fn books_consistent(k: &Kernel) -> bool {
    k.resources().all(|(_, r)| r.book().is_consistent())
}

/// Kinds of the dispatched events still in the log, oldest first.
pub fn dispatched_kinds(k: &Kernel) -> Vec<EventKind> {
    k.dispatch_log().iter().map(|r| r.kind).collect()
}

// ===========================================================================
// Benchmark scenarios
// ===========================================================================

/// `count` activities contending for `resources` single resources, each
/// listing every resource as a candidate.
pub fn build_contended_scenario(count: u32, resources: u32) -> Kernel {
    let mut k = Kernel::default();
    let pool: Vec<ResourceId> = (0..resources.max(1))
        .map(|i| k.add_resource(Resource::single(format!("r{i}"))))
        .collect();
    for i in 0..count {
        let a = Activity::new(key(1, i, 10), format!("a{i}"), Spans::new(1, u64::from(5 + i % 7), 1, 1, 0))
            .released_at(u64::from(i % 13))
            .requires(ResourceRequirement::any_of(pool.iter().copied()));
        k.add_activity(a).expect("valid activity");
    }
    k
}

/// A chain of `length` operations, each consuming the previous one's output
/// through one buffer area.
pub fn build_chain_scenario(length: u32) -> Kernel {
    let mut k = Kernel::default();
    let buffer = k.add_area(StorageArea::new("buffer", units(1_000_000)));
    let machine = k.add_resource(Resource::single("machine"));
    let mut previous: Option<MaterialId> = None;
    for step in 0..length {
        let out = k.add_material(MaterialDef::new(format!("m{step}")));
        let mut a = Activity::new(key(1, 1, (step + 1) * 10), format!("step{step}"), Spans::new(1, 10, 0, 1, 0))
            .requires(ResourceRequirement::on(machine))
            .produces(OutputSpec::new(out, units(10)).into_area(buffer));
        if let Some(input) = previous {
            a = a.consumes(MaterialRequirement::new(input, units(10)).from_area(buffer));
        }
        k.add_activity(a).expect("valid activity");
        previous = Some(out);
    }
    k
}

/// `count` activities on one multitasking resource, half of them sharing
/// batches.
pub fn build_batching_scenario(count: u32, capacity: u32) -> Kernel {
    let mut k = Kernel::default();
    let oven = k.add_resource(Resource::multitasking("oven", capacity));
    for i in 0..count {
        let a = run_on(key(1, i, 10), oven, 20).released_at(u64::from(i / 2) * 5);
        k.add_activity(a).expect("valid activity");
    }
    k
}
