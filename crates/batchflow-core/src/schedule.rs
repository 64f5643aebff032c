//! Read-only schedule output handed to consumers after a run.
//!
//! All types are owned copies keyed by names and activity keys, with no
//! references into kernel arenas, so a report can be serialized, diffed or
//! sent across threads without borrowing the kernel.

use crate::block::BlockTimes;
use crate::fixed::{Quantity, Ticks};
use crate::id::{ActivityKey, LotCode};
use crate::kernel::Kernel;
use crate::sim::RunOutcome;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One placed block: an activity's occupation of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub activity: ActivityKey,
    pub activity_name: String,
    pub resource: String,
    /// Number of blocks sharing the batch (1 on single resources).
    pub batch_size: usize,
    pub times: BlockTimes,
}

/// Final state of a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotRecord {
    pub code: LotCode,
    pub material: String,
    pub total: Quantity,
    pub consumed: Quantity,
    pub remaining: Quantity,
    pub produced_at: Ticks,
    pub expires_at: Option<Ticks>,
    pub expired: bool,
    /// Activity that produced the lot, `None` for supplied lots.
    pub producer: Option<ActivityKey>,
    pub location: Option<String>,
}

/// Material still held in a storage area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub storage: String,
    pub lot: LotCode,
    pub material: String,
    pub quantity: Quantity,
    pub produced_at: Ticks,
    pub expires_at: Option<Ticks>,
}

/// The finalized schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub outcome: RunOutcome,
    /// Blocks ordered by start tick, then activity key.
    pub blocks: Vec<BlockRecord>,
    /// Lots in creation order.
    pub lots: Vec<LotRecord>,
    pub inventories: Vec<InventoryRecord>,
    pub unplaced: Vec<(ActivityKey, String)>,
}

impl ScheduleReport {
    /// Blocks of one activity.
    pub fn blocks_of(&self, activity: ActivityKey) -> impl Iterator<Item = &BlockRecord> + '_ {
        self.blocks.iter().filter(move |b| b.activity == activity)
    }

    pub fn lot(&self, code: &str) -> Option<&LotRecord> {
        self.lots.iter().find(|l| l.code.as_str() == code)
    }

    /// Every block is monotonic, and an activity is either unplaced or has
    /// at least one block, never both.
    pub fn is_consistent(&self) -> bool {
        let monotonic = self.blocks.iter().all(|b| b.times.is_monotonic());
        let disjoint = self
            .unplaced
            .iter()
            .all(|(key, _)| self.blocks_of(*key).next().is_none());
        monotonic && disjoint
    }

    /// Latest storage-end over all blocks.
    pub fn makespan(&self) -> Ticks {
        self.blocks.iter().map(|b| b.times.storage_end).max().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Building the report
// ---------------------------------------------------------------------------

impl Kernel {
    /// Snapshot the current schedule.
    pub fn schedule_report(&self, outcome: RunOutcome) -> ScheduleReport {
        let key_of = |id| self.activity(id).map(|a| a.key);
        let material_name = |m| self.material(m).map(|d| d.name.clone()).unwrap_or_default();
        let area_name = |a| self.area(a).map(|s| s.name.clone());

        let mut blocks: Vec<BlockRecord> = self
            .blocks()
            .filter_map(|(_, block)| {
                let activity = self.activity(block.activity)?;
                Some(BlockRecord {
                    activity: activity.key,
                    activity_name: activity.name.clone(),
                    resource: self.resource(block.resource)?.name.clone(),
                    batch_size: self.batch(block.batch).map_or(1, |b| b.len()),
                    times: block.times,
                })
            })
            .collect();
        blocks.sort_by(|a, b| {
            (a.times.start, a.activity, &a.resource).cmp(&(b.times.start, b.activity, &b.resource))
        });

        let lots = self
            .lots()
            .map(|(_, lot)| LotRecord {
                code: lot.code.clone(),
                material: material_name(lot.material),
                total: lot.total,
                consumed: lot.consumed(),
                remaining: lot.remaining(),
                produced_at: lot.produced_at,
                expires_at: lot.expires_at,
                expired: lot.is_expired(),
                producer: lot.producer.and_then(key_of),
                location: lot.location.and_then(area_name),
            })
            .collect();

        let inventories = self
            .inventories()
            .filter_map(|(_, inv)| {
                let lot = self.lot(inv.lot)?;
                Some(InventoryRecord {
                    storage: area_name(inv.storage)?,
                    lot: lot.code.clone(),
                    material: material_name(inv.material),
                    quantity: lot.remaining(),
                    produced_at: inv.produced_at,
                    expires_at: inv.expires_at,
                })
            })
            .collect();

        ScheduleReport {
            outcome,
            blocks,
            lots,
            inventories,
            unplaced: self.unplaced(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::units;
    use crate::test_utils::*;

    #[test]
    fn report_lists_blocks_in_start_order() {
        let (mut k, mixer) = kernel_with_single_resource("mixer");
        k.add_activity(run_on(key(1, 1, 20), mixer, 10).released_at(5)).unwrap();
        k.add_activity(run_on(key(1, 1, 10), mixer, 5)).unwrap();
        let run = k.run();

        let report = k.schedule_report(run.outcome);
        assert_eq!(report.outcome, RunOutcome::Exhausted);
        let order: Vec<_> = report.blocks.iter().map(|b| b.activity).collect();
        assert_eq!(order, vec![key(1, 1, 10), key(1, 1, 20)]);
        assert_eq!(report.blocks[0].resource, "mixer");
        assert_eq!(report.blocks[1].times.start, 5);
        assert_eq!(report.makespan(), 15);
        assert!(report.is_consistent());
    }

    #[test]
    fn report_carries_lots_and_inventories() {
        let mut k = Kernel::default();
        let flour = k.add_material(MaterialDef::new("flour"));
        let silo = k.add_area(StorageArea::new("silo", units(1000)));
        k.add_lot(Lot::on_hand("F1", flour, units(100), 0).at(silo)).unwrap();
        let mixer = k.add_resource(Resource::single("mixer"));
        k.add_activity(
            run_on(key(1, 1, 10), mixer, 10).consumes(MaterialRequirement::new(flour, units(40))),
        )
        .unwrap();
        let run = k.run();

        let report = k.schedule_report(run.outcome);
        let lot = report.lot("F1").unwrap();
        assert_eq!(lot.consumed, units(40));
        assert_eq!(lot.remaining, units(60));
        assert_eq!(lot.location.as_deref(), Some("silo"));
        assert_eq!(report.inventories.len(), 1);
        assert_eq!(report.inventories[0].quantity, units(60));
        assert_eq!(report.inventories[0].material, "flour");
    }

    #[test]
    fn unplaced_activities_have_no_blocks() {
        let mut k = Kernel::default();
        let salt = k.add_material(MaterialDef::new("salt"));
        let mixer = k.add_resource(Resource::single("mixer"));
        k.add_activity(
            run_on(key(2, 1, 10), mixer, 10).consumes(MaterialRequirement::new(salt, units(1))),
        )
        .unwrap();
        let run = k.run();

        let report = k.schedule_report(run.outcome);
        assert!(report.blocks.is_empty());
        assert_eq!(report.unplaced.len(), 1);
        assert_eq!(report.unplaced[0].0, key(2, 1, 10));
        assert!(report.is_consistent());
    }

    #[test]
    fn report_serializes_to_json() {
        let (mut k, mixer) = kernel_with_single_resource("oven");
        k.add_activity(run_on(key(1, 1, 10), mixer, 3)).unwrap();
        let run = k.run();
        let report = k.schedule_report(run.outcome);

        let json = serde_json::to_string(&report).unwrap();
        let back: ScheduleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
