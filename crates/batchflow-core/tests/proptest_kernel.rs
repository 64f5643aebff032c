//! Property-based tests for the scheduling kernel.
//!
//! Uses proptest to generate random activity sets over a small resource
//! pool, then verify structural invariants hold after a run.

use batchflow_core::activity::{Activity, ActivityState, ResourceRequirement};
use batchflow_core::block::Spans;
use batchflow_core::fixed::{units, Quantity};
use batchflow_core::id::*;
use batchflow_core::kernel::Kernel;
use batchflow_core::material::{Lot, MaterialDef, MaterialRequirement};
use batchflow_core::placement::UndoFlags;
use batchflow_core::reservation::Resource;
use batchflow_core::serialize::{FORMAT_VERSION, MIN_FORMAT_VERSION};
use batchflow_core::sim::RunOutcome;
use batchflow_core::test_utils::{books_consistent, key};
use proptest::prelude::*;

// ===========================================================================
// Generators
// ===========================================================================

#[derive(Debug, Clone)]
struct ActivityShape {
    release: u64,
    setup: u64,
    run: u64,
    clean: u64,
    /// Bit mask over the resource pool; zero selects the first resource.
    candidates: u8,
}

fn arb_activity() -> impl Strategy<Value = ActivityShape> {
    (0..60u64, 0..4u64, 1..25u64, 0..3u64, any::<u8>()).prop_map(|(release, setup, run, clean, candidates)| {
        ActivityShape {
            release,
            setup,
            run,
            clean,
            candidates,
        }
    })
}

/// Three single resources and one multitasking resource with capacity 2.
fn build(shapes: &[ActivityShape]) -> Kernel {
    let mut k = Kernel::default();
    let mut pool = Vec::new();
    for i in 0..3 {
        pool.push(k.add_resource(Resource::single(format!("r{i}"))));
    }
    pool.push(k.add_resource(Resource::multitasking("shared", 2)));

    for (i, shape) in shapes.iter().enumerate() {
        let mut candidates: Vec<ResourceId> = pool
            .iter()
            .enumerate()
            .filter(|(bit, _)| shape.candidates & (1 << bit) != 0)
            .map(|(_, r)| *r)
            .collect();
        if candidates.is_empty() {
            candidates.push(pool[0]);
        }
        let activity = Activity::new(
            key(1, i as u32, 10),
            format!("a{i}"),
            Spans::new(shape.setup, shape.run, 0, shape.clean, 0),
        )
        .released_at(shape.release)
        .requires(ResourceRequirement::any_of(candidates));
        k.add_activity(activity).expect("generated activity is valid");
    }
    k
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reserved windows on every resource stay pairwise disjoint.
    #[test]
    fn reservations_never_overlap(shapes in proptest::collection::vec(arb_activity(), 1..40)) {
        let mut k = build(&shapes);
        k.run();
        prop_assert!(books_consistent(&k));
    }

    /// After an exhausted run nothing is left pending or waiting.
    #[test]
    fn no_activity_is_left_open(shapes in proptest::collection::vec(arb_activity(), 1..40)) {
        let mut k = build(&shapes);
        let report = k.run();
        prop_assert_eq!(report.outcome, RunOutcome::Exhausted);
        for (_, a) in k.activities() {
            prop_assert!(
                matches!(a.state(), ActivityState::Placed | ActivityState::Unplaceable(_)),
                "activity {} left in {:?}", a.key, a.state()
            );
        }
    }

    /// Resource-only activities always place, never before their release.
    #[test]
    fn placements_respect_release(shapes in proptest::collection::vec(arb_activity(), 1..40)) {
        let mut k = build(&shapes);
        k.run();
        for (id, a) in k.activities() {
            let placement = k.placement(id);
            prop_assert!(placement.is_some(), "activity {} unplaced", a.key);
            if let Some(p) = placement {
                prop_assert!(p.times.start >= a.release);
                prop_assert!(p.times.is_monotonic());
            }
        }
    }

    /// Undoing every placement leaves every book empty.
    #[test]
    fn undo_releases_every_window(shapes in proptest::collection::vec(arb_activity(), 1..30)) {
        let mut k = build(&shapes);
        k.run();
        let ids: Vec<ActivityId> = k.activities().map(|(id, _)| id).collect();
        for id in ids.into_iter().rev() {
            k.unschedule(id, UndoFlags::default()).expect("undo succeeds");
        }
        prop_assert!(k.resources().all(|(_, r)| r.book().is_empty()));
        prop_assert_eq!(k.blocks().count(), 0);
    }

    /// Identical inputs produce identical schedules.
    #[test]
    fn runs_are_deterministic(shapes in proptest::collection::vec(arb_activity(), 1..40)) {
        let mut a = build(&shapes);
        let mut b = build(&shapes);
        a.run();
        b.run();
        prop_assert_eq!(a.state_hash(), b.state_hash());
    }

    /// A current-version snapshot restores the same state, and every older
    /// version still loads.
    #[test]
    fn snapshots_restore_across_versions(shapes in proptest::collection::vec(arb_activity(), 1..25)) {
        let mut k = build(&shapes);
        k.run();

        let bytes = k.to_bytes().expect("encode");
        let restored = Kernel::from_bytes(&bytes).expect("decode");
        prop_assert_eq!(restored.state_hash(), k.state_hash());

        for version in MIN_FORMAT_VERSION..FORMAT_VERSION {
            let old = k.encode_at(version).expect("encode older version");
            let loaded = Kernel::from_bytes(&old).expect("decode older version");
            prop_assert_eq!(loaded.blocks().count(), k.blocks().count());
            prop_assert_eq!(loaded.activities().count(), k.activities().count());
        }
    }

    /// Drawn quantity equals the demand of placed consumers and never
    /// exceeds the lot.
    #[test]
    fn draws_conserve_material(
        stock in 10u32..200,
        demands in proptest::collection::vec((1u32..40, 0..50u64), 1..20),
    ) {
        let mut k = Kernel::default();
        let m = k.add_material(MaterialDef::new("ore"));
        let lot = k.add_lot(Lot::on_hand("ORE-1", m, units(stock), 0)).expect("valid lot");
        let press = k.add_resource(Resource::single("press"));
        for (i, (qty, release)) in demands.iter().enumerate() {
            let a = Activity::new(key(2, i as u32, 10), format!("d{i}"), Spans::run_only(3))
                .released_at(*release)
                .requires(ResourceRequirement::on(press))
                .consumes(MaterialRequirement::new(m, units(*qty)));
            k.add_activity(a).expect("valid activity");
        }
        k.run();

        let placed: Quantity = k
            .activities()
            .filter(|(_, a)| a.is_placed())
            .flat_map(|(_, a)| a.materials.iter().map(|r| r.quantity))
            .sum();
        let l = k.lot(lot).expect("lot kept");
        prop_assert_eq!(l.consumed(), placed);
        prop_assert!(l.consumed() <= l.total);
    }
}
