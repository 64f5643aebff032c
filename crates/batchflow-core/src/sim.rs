//! Run configuration, driver state and run outcomes.

use crate::fixed::{Quantity, Ticks};
use crate::id::ActivityKey;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Kernel configuration, supplied by the caller before a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Latest tick the driver dispatches events for.
    pub planning_horizon: Ticks,
    /// When set, reaching the horizon with work left extends it by this
    /// many ticks instead of halting.
    pub horizon_extension: Option<Ticks>,
    /// Upper bound on horizon extensions per run.
    pub max_horizon_extensions: u32,
    /// Capacity of the dispatch log ring buffer.
    pub dispatch_log_capacity: usize,
    /// Fail the run after this many dispatches.
    pub max_dispatches: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            planning_horizon: Ticks::MAX / 2,
            horizon_extension: None,
            max_horizon_extensions: 0,
            dispatch_log_capacity: 256,
            max_dispatches: None,
        }
    }
}

impl KernelConfig {
    pub fn with_horizon(horizon: Ticks) -> Self {
        Self {
            planning_horizon: horizon,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Driver state
// ---------------------------------------------------------------------------

/// Driver state machine: `Idle -> Running -> (Idle | Halted)`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    /// Stopped at the horizon or by a failure. A later `run_to` with a
    /// larger horizon resumes.
    Halted,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// The queue ran out of work.
    Exhausted,
    /// The planning horizon was reached with work still queued.
    Horizon,
    /// A handler hit a contract violation or the dispatch limit.
    Failed(String),
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Exhausted => f.write_str("exhausted"),
            RunOutcome::Horizon => f.write_str("horizon"),
            RunOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Summary returned by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Events dispatched during this call.
    pub dispatched: u64,
    /// Clock when the run stopped.
    pub clock: Ticks,
    /// Activities left without a placement, with the last failure reason.
    pub unplaced: Vec<(ActivityKey, String)>,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// Deterministic FNV-1a (64-bit) hash of kernel state. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_quantity(&mut self, v: Quantity) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
