use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies an activity (one schedulable operation) in the kernel arena.
    pub struct ActivityId;

    /// Identifies a schedulable resource (machine, line, oven).
    pub struct ResourceId;

    /// Identifies a traceable lot of material.
    pub struct LotId;

    /// Identifies an inventory record (material resident in a storage area).
    pub struct InventoryId;

    /// Identifies a capacity-bounded storage area (tank, silo, staging area).
    pub struct StorageAreaId;

    /// Identifies a connector moving material into or out of a storage area.
    pub struct ConnectorId;

    /// Identifies a placed block (one activity on one resource).
    pub struct BlockId;

    /// Identifies a batch (one or more blocks sharing a placement).
    pub struct BatchId;
}

/// Identifies a material definition. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub u32);

/// Job number supplied by the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

/// Manufacturing order number, unique within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u32);

/// Operation number, unique within its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u32);

/// Stable identity of an activity: the (job, order, operation) triple.
///
/// Two activities are the same activity iff their keys are equal, regardless
/// of which arena slot they live in. Ordering is lexicographic, which gives
/// reports a stable job/order/operation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActivityKey {
    pub job: JobId,
    pub order: OrderId,
    pub operation: OperationId,
}

impl ActivityKey {
    pub fn new(job: u32, order: u32, operation: u32) -> Self {
        Self {
            job: JobId(job),
            order: OrderId(order),
            operation: OperationId(operation),
        }
    }
}

impl std::fmt::Display for ActivityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job.0, self.order.0, self.operation.0)
    }
}

/// Human-readable lot code, used by explicit eligible-lot sets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LotCode(pub String);

impl LotCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LotCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
