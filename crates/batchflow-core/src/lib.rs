//! Batchflow Core -- a discrete-event scheduling kernel for batch production.
//!
//! This crate places production activities onto resources in simulated
//! time while tracking the material they consume and produce, the storage
//! areas and connectors that material moves through, and the blocks and
//! batches that record each placement. Runs are deterministic: the same
//! entity graph always yields the same schedule.
//!
//! # Event Loop
//!
//! Each call to [`kernel::Kernel::run_to`] dispatches queued events in
//! `(tick, type id, sequence)` order until the queue runs out of work or
//! the planning horizon is reached:
//!
//! 1. **Expiry** -- shelf-life and storage-usage expiry free material and
//!    capacity first.
//! 2. **Completion** -- finished multitasking batches and tank cleanouts
//!    wake the activities parked on them.
//! 3. **Retry** -- connector and resource retries re-attempt placements
//!    that hit a conflict.
//! 4. **Attempt** -- new and woken activities try to place.
//! 5. **Horizon** -- the horizon marker extends or halts the run.
//!
//! # Building a Scenario
//!
//! ```rust,ignore
//! let mut kernel = Kernel::default();
//! let mixer = kernel.add_resource(Resource::single("mixer"));
//! kernel.add_activity(
//!     Activity::new(ActivityKey::new(1, 1, 10), "mix", Spans::run_only(30))
//!         .requires(ResourceRequirement::on(mixer)),
//! )?;
//! let report = kernel.run();
//! ```
//!
//! # Key Types
//!
//! - [`kernel::Kernel`] -- Entity arenas, event queue and driver.
//! - [`activity::Activity`] -- A unit of work with resource and material
//!   demands.
//! - [`reservation::ReservationBook`] -- Non-overlapping windows on one
//!   resource.
//! - [`material::Lot`] -- A traceable quantity of material with usability
//!   policies in [`material::Usability`].
//! - [`storage::UsageLedger`] -- Capacity accounting for areas and
//!   connectors.
//! - [`block::Batch`] -- Blocks sharing one placement on a resource.
//! - [`schedule::ScheduleReport`] -- The finalized schedule.
//! - [`serialize`] -- Versioned binary snapshots via bitcode.

pub mod activity;
pub mod block;
#[cfg(feature = "data-loader")]
pub mod data_loader;
pub mod event;
pub mod fixed;
pub mod id;
pub mod kernel;
pub mod material;
pub mod placement;
pub mod reservation;
pub mod schedule;
pub mod serialize;
pub mod sim;
pub mod storage;
pub mod time;
pub mod versioning;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use kernel::{run_scenarios, Kernel, KernelError};
pub use placement::{UndoError, UndoFlags};
pub use sim::{KernelConfig, RunOutcome, RunReport};
