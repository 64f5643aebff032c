//! Integration test: worn tools and eligible-lot sets.
//!
//! Blades are drawn one unit per cut and wear out after two cuts, so later
//! cuts move on to the next blade. A finishing step may only use the blade
//! named in its eligible set.

use batchflow_core::data_loader::build_kernel;
use batchflow_core::sim::{KernelConfig, RunOutcome};
use batchflow_core::test_utils::{key, placed_times, units};
use batchflow_data::load_scenario_file;
use std::fs;

const WORKSHOP: &str = r#"{
    "materials": [{"name": "blade"}],
    "resources": [{"name": "saw"}, {"name": "lathe"}],
    "lots": [
        {"code": "B1", "material": "blade", "quantity": 10},
        {"code": "B2", "material": "blade", "quantity": 10},
        {"code": "B3", "material": "blade", "quantity": 10}
    ],
    "activities": [
        {"job": 1, "order": 1, "operation": 10, "name": "cut", "run": 5, "resources": [["saw"]],
         "materials": [{"material": "blade", "quantity": 1, "usability": {"wear": {"max_uses": 2}}}]},
        {"job": 2, "order": 1, "operation": 10, "name": "cut", "run": 5, "resources": [["saw"]],
         "materials": [{"material": "blade", "quantity": 1, "usability": {"wear": {"max_uses": 2}}}]},
        {"job": 3, "order": 1, "operation": 10, "name": "cut", "run": 5, "resources": [["saw"]],
         "materials": [{"material": "blade", "quantity": 1, "usability": {"wear": {"max_uses": 2}}}]},
        {"job": 4, "order": 1, "operation": 10, "name": "finish", "run": 3, "resources": [["lathe"]],
         "materials": [{"material": "blade", "quantity": 1, "usability": {"shelf_life": {"eligible": ["B3"]}}}]}
    ]
}"#;

fn load() -> batchflow_core::kernel::Kernel {
    let dir = std::env::temp_dir().join(format!("batchflow_it_wear_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("workshop.json");
    fs::write(&path, WORKSHOP).unwrap();
    let data = load_scenario_file(&path).unwrap();
    let _ = fs::remove_dir_all(&dir);
    build_kernel(&data, KernelConfig::default()).unwrap()
}

fn uses_of(k: &batchflow_core::kernel::Kernel, code: &str) -> u32 {
    k.lots()
        .find(|(_, l)| l.code.as_str() == code)
        .map(|(_, l)| l.uses())
        .unwrap()
}

#[test]
fn worn_blade_is_replaced() {
    let mut k = load();
    let run = k.run();
    assert_eq!(run.outcome, RunOutcome::Exhausted);
    assert!(run.unplaced.is_empty(), "{:?}", run.unplaced);

    assert_eq!(placed_times(&k, key(1, 1, 10)).unwrap().start, 0);
    assert_eq!(placed_times(&k, key(2, 1, 10)).unwrap().start, 5);
    assert_eq!(placed_times(&k, key(3, 1, 10)).unwrap().start, 10);

    assert_eq!(uses_of(&k, "B1"), 2);
    assert_eq!(uses_of(&k, "B2"), 1);
}

#[test]
fn eligible_set_pins_the_lot() {
    let mut k = load();
    k.run();
    assert_eq!(placed_times(&k, key(4, 1, 10)).unwrap().start, 0);
    assert_eq!(uses_of(&k, "B3"), 1);
    let b3 = k.lots().find(|(_, l)| l.code.as_str() == "B3").unwrap().1;
    assert_eq!(b3.consumed(), units(1));
}

#[test]
fn reset_run_restores_tool_wear() {
    let mut k = load();
    k.run();
    let first = k.state_hash();

    k.reset_run().unwrap();
    assert_eq!(uses_of(&k, "B1"), 0);

    k.run();
    assert_eq!(k.state_hash(), first);
}
