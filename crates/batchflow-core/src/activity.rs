//! Activities: schedulable units of operation work.

use crate::block::{BlockTimes, Spans};
use crate::fixed::{Quantity, Ticks};
use crate::id::*;
use crate::material::{Draw, MaterialRequirement};
use crate::storage::Usage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    #[error("activity {0} has a zero run span")]
    ZeroRun(ActivityKey),
    #[error("activity {key} resource requirement {index} lists no candidates")]
    NoCandidates { key: ActivityKey, index: usize },
    #[error("activity {key} material requirement {index} has a non-positive quantity")]
    NonPositiveDemand { key: ActivityKey, index: usize },
    #[error("activity {0} produces a non-positive quantity")]
    NonPositiveOutput(ActivityKey),
}

/// Demand on one resource, satisfied by the first candidate that is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub candidates: Vec<ResourceId>,
    /// The resource this requirement was satisfied by, once placed.
    pub assigned: Option<ResourceId>,
}

impl ResourceRequirement {
    pub fn on(resource: ResourceId) -> Self {
        Self {
            candidates: vec![resource],
            assigned: None,
        }
    }

    pub fn any_of(candidates: impl IntoIterator<Item = ResourceId>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
            assigned: None,
        }
    }
}

/// What a placed activity produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub material: MaterialId,
    pub quantity: Quantity,
    /// Area the produced lot is stored in.
    pub storage: Option<StorageAreaId>,
    /// Connector the produced material flows through.
    pub connector: Option<ConnectorId>,
    pub tags: BTreeSet<String>,
}

impl OutputSpec {
    pub fn new(material: MaterialId, quantity: Quantity) -> Self {
        Self {
            material,
            quantity,
            storage: None,
            connector: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn into_area(mut self, area: StorageAreaId) -> Self {
        self.storage = Some(area);
        self
    }

    pub fn through(mut self, connector: ConnectorId) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Why an activity is waiting, and so which event will wake it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    /// Retry-for-resource-usage event at `until`.
    Resource { resource: ResourceId, until: Ticks },
    /// Block-finished event of a multitasking batch.
    Batch(BatchId),
    /// Material-available event for this material.
    Material(MaterialId),
    /// Usage-expired or cleanout event on this area.
    StorageArea(StorageAreaId),
    /// Connector retry event at `until`.
    Connector { connector: ConnectorId, until: Ticks },
}

/// Scheduling state of an activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    /// Not yet attempted.
    #[default]
    Pending,
    Waiting(WaitReason),
    Placed,
    /// The run ended without a placement; carries the last failure.
    Unplaceable(String),
}

/// A unit of production work tied to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub key: ActivityKey,
    pub name: String,
    /// Earliest tick the activity may start.
    pub release: Ticks,
    pub spans: Spans,
    pub resources: Vec<ResourceRequirement>,
    pub materials: Vec<MaterialRequirement>,
    pub output: Option<OutputSpec>,
    pub(crate) state: ActivityState,
    pub(crate) attempts: u32,
}

impl Activity {
    pub fn new(key: ActivityKey, name: impl Into<String>, spans: Spans) -> Self {
        Self {
            key,
            name: name.into(),
            release: 0,
            spans,
            resources: Vec::new(),
            materials: Vec::new(),
            output: None,
            state: ActivityState::Pending,
            attempts: 0,
        }
    }

    pub fn released_at(mut self, tick: Ticks) -> Self {
        self.release = tick;
        self
    }

    pub fn requires(mut self, requirement: ResourceRequirement) -> Self {
        self.resources.push(requirement);
        self
    }

    pub fn consumes(mut self, requirement: MaterialRequirement) -> Self {
        self.materials.push(requirement);
        self
    }

    pub fn produces(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn state(&self) -> &ActivityState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_placed(&self) -> bool {
        self.state == ActivityState::Placed
    }

    /// Whether a placement attempt still makes sense.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ActivityState::Pending | ActivityState::Waiting(_))
    }

    pub fn validate(&self) -> Result<(), ActivityError> {
        if self.spans.run == 0 {
            return Err(ActivityError::ZeroRun(self.key));
        }
        for (index, req) in self.resources.iter().enumerate() {
            if req.candidates.is_empty() {
                return Err(ActivityError::NoCandidates {
                    key: self.key,
                    index,
                });
            }
        }
        for (index, req) in self.materials.iter().enumerate() {
            if req.quantity <= Quantity::ZERO {
                return Err(ActivityError::NonPositiveDemand {
                    key: self.key,
                    index,
                });
            }
        }
        if self.output.as_ref().is_some_and(|o| o.quantity <= Quantity::ZERO) {
            return Err(ActivityError::NonPositiveOutput(self.key));
        }
        Ok(())
    }

    /// Reset run-scoped state.
    pub(crate) fn reset(&mut self) {
        self.state = ActivityState::Pending;
        self.attempts = 0;
        for req in &mut self.resources {
            req.assigned = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Where a usage window was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UsageTarget {
    Area(StorageAreaId),
    Connector(ConnectorId),
}

/// A usage opened by a placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenUsage {
    pub target: UsageTarget,
    pub usage: Usage,
}

/// Everything a successful placement committed, kept so it can be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub times: BlockTimes,
    pub blocks: Vec<BlockId>,
    pub draws: Vec<Draw>,
    pub usages: Vec<OpenUsage>,
    pub output_lot: Option<LotId>,
    pub inventory: Option<InventoryId>,
    /// Lots this placement drew to zero, whose inventories it retired.
    pub emptied: Vec<LotId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::units;
    use slotmap::SlotMap;

    fn resource() -> ResourceId {
        let mut sm = SlotMap::<ResourceId, ()>::with_key();
        sm.insert(())
    }

    #[test]
    fn new_activity_is_pending_and_open() {
        let a = Activity::new(ActivityKey::new(1, 1, 10), "mix", Spans::run_only(5));
        assert_eq!(a.state(), &ActivityState::Pending);
        assert!(a.is_open());
        assert!(!a.is_placed());
    }

    #[test]
    fn zero_run_is_invalid() {
        let a = Activity::new(ActivityKey::new(1, 1, 10), "mix", Spans::new(5, 0, 0, 0, 0));
        assert_eq!(a.validate(), Err(ActivityError::ZeroRun(ActivityKey::new(1, 1, 10))));
    }

    #[test]
    fn empty_candidate_list_is_invalid() {
        let a = Activity::new(ActivityKey::new(1, 1, 10), "mix", Spans::run_only(5))
            .requires(ResourceRequirement::any_of([]));
        assert!(matches!(a.validate(), Err(ActivityError::NoCandidates { index: 0, .. })));
    }

    #[test]
    fn non_positive_quantities_are_invalid() {
        let key = ActivityKey::new(1, 1, 10);
        let a = Activity::new(key, "mix", Spans::run_only(5))
            .consumes(MaterialRequirement::new(MaterialId(0), units(0)));
        assert!(matches!(a.validate(), Err(ActivityError::NonPositiveDemand { .. })));

        let b = Activity::new(key, "mix", Spans::run_only(5))
            .produces(OutputSpec::new(MaterialId(0), units(0)));
        assert_eq!(b.validate(), Err(ActivityError::NonPositiveOutput(key)));
    }

    #[test]
    fn reset_clears_assignment() {
        let r = resource();
        let mut a = Activity::new(ActivityKey::new(1, 1, 10), "mix", Spans::run_only(5))
            .requires(ResourceRequirement::on(r));
        a.resources[0].assigned = Some(r);
        a.state = ActivityState::Placed;
        a.attempts = 3;
        a.reset();
        assert_eq!(a.resources[0].assigned, None);
        assert_eq!(a.state(), &ActivityState::Pending);
        assert_eq!(a.attempts(), 0);
    }
}
