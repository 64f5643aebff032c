//! Storage areas, connectors and their usage ledgers.
//!
//! Both storage areas and connectors bound the quantity of material moving
//! through them at once. Each open movement is a quantity-weighted usage
//! window in a [`UsageLedger`]; a new usage fits only if the peak load over
//! its window stays within capacity.
//!
//! A storage area may also be a tank. A tank holds at most one inventory
//! and, once emptied or purged, may need a cleanout before it accepts the
//! next one.

use crate::fixed::{Quantity, Ticks};
use crate::id::{ActivityId, InventoryId, StorageAreaId};
use crate::time::Window;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Placement failure. Recovered with a usage-expired or connector retry.
    #[error("usage of {requested} over {window} exceeds capacity {capacity}; next release at {next_free}")]
    Saturated {
        window: Window,
        requested: Quantity,
        capacity: Quantity,
        next_free: Ticks,
    },
    #[error("usage of {requested} can never fit capacity {capacity}")]
    ExceedsCapacity {
        requested: Quantity,
        capacity: Quantity,
    },
    #[error("tank already holds an inventory")]
    TankOccupied,
    #[error("tank is being cleaned until tick {0}")]
    TankCleaning(Ticks),
    #[error("no such usage is open")]
    UnknownUsage,
    #[error("unknown storage area")]
    UnknownArea,
    #[error("unknown connector")]
    UnknownConnector,
}

// ---------------------------------------------------------------------------
// UsageLedger
// ---------------------------------------------------------------------------

/// Direction of a material movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flow {
    Inflow,
    Outflow,
}

/// One open movement through an area or connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub window: Window,
    pub quantity: Quantity,
    pub flow: Flow,
    pub activity: ActivityId,
}

/// Quantity-weighted usage windows under a capacity ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub capacity: Quantity,
    usages: Vec<Usage>,
}

impl UsageLedger {
    pub fn new(capacity: Quantity) -> Self {
        Self {
            capacity,
            usages: Vec::new(),
        }
    }

    /// Peak concurrent load within `window`, counting only usages that
    /// overlap it.
    pub fn peak_load(&self, window: Window) -> Quantity {
        let overlapping: Vec<&Usage> = self
            .usages
            .iter()
            .filter(|u| u.window.overlaps(&window))
            .collect();

        // Load is piecewise constant and only rises at a usage start, so the
        // peak is found at the window start or at some usage start inside it.
        let mut probes: Vec<Ticks> = vec![window.start];
        probes.extend(
            overlapping
                .iter()
                .map(|u| u.window.start)
                .filter(|s| window.contains(*s)),
        );
        probes
            .into_iter()
            .map(|t| {
                overlapping
                    .iter()
                    .filter(|u| u.window.contains(t))
                    .map(|u| u.quantity)
                    .sum::<Quantity>()
            })
            .max()
            .unwrap_or(Quantity::ZERO)
    }

    /// Check whether a usage of `quantity` over `window` fits, without
    /// recording it.
    pub fn check(&self, window: Window, quantity: Quantity) -> Result<(), StorageError> {
        if quantity > self.capacity {
            return Err(StorageError::ExceedsCapacity {
                requested: quantity,
                capacity: self.capacity,
            });
        }
        if self.peak_load(window) + quantity <= self.capacity {
            return Ok(());
        }
        let next_free = self
            .usages
            .iter()
            .filter(|u| u.window.overlaps(&window))
            .map(|u| u.window.end)
            .filter(|end| *end > window.start)
            .min()
            .unwrap_or(window.end);
        Err(StorageError::Saturated {
            window,
            requested: quantity,
            capacity: self.capacity,
            next_free,
        })
    }

    /// Open a usage. On failure the ledger is unchanged.
    pub fn try_open(&mut self, usage: Usage) -> Result<(), StorageError> {
        self.check(usage.window, usage.quantity)?;
        self.usages.push(usage);
        Ok(())
    }

    /// Close a previously opened usage (undo).
    pub fn close(&mut self, usage: &Usage) -> Result<(), StorageError> {
        let index = self
            .usages
            .iter()
            .position(|u| u == usage)
            .ok_or(StorageError::UnknownUsage)?;
        self.usages.remove(index);
        Ok(())
    }

    /// Drop usages that ended at or before `now`. Returns how many closed.
    pub fn expire(&mut self, now: Ticks) -> usize {
        let before = self.usages.len();
        self.usages.retain(|u| u.window.end > now);
        before - self.usages.len()
    }

    pub fn usages(&self) -> &[Usage] {
        &self.usages
    }

    pub fn clear(&mut self) {
        self.usages.clear();
    }

    pub(crate) fn from_usages(capacity: Quantity, usages: Vec<Usage>) -> Self {
        Self { capacity, usages }
    }
}

// ---------------------------------------------------------------------------
// StorageArea
// ---------------------------------------------------------------------------

/// Occupancy of a tank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TankState {
    #[default]
    Empty,
    Holding(InventoryId),
    Cleaning { until: Ticks },
}

/// A capacity-bounded location in the material-flow topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageArea {
    pub name: String,
    pub ledger: UsageLedger,
    /// `Some` for tanks, which hold a single inventory at a time.
    pub tank: Option<TankState>,
    /// Cleanout duration after a tank is emptied.
    pub cleanout: Ticks,
}

impl StorageArea {
    pub fn new(name: impl Into<String>, capacity: Quantity) -> Self {
        Self {
            name: name.into(),
            ledger: UsageLedger::new(capacity),
            tank: None,
            cleanout: 0,
        }
    }

    /// A tank with the given flow capacity and cleanout duration.
    pub fn tank(name: impl Into<String>, capacity: Quantity, cleanout: Ticks) -> Self {
        Self {
            name: name.into(),
            ledger: UsageLedger::new(capacity),
            tank: Some(TankState::Empty),
            cleanout,
        }
    }

    pub fn is_tank(&self) -> bool {
        self.tank.is_some()
    }

    /// Whether the area can take a new inventory now.
    pub fn check_accepts_inventory(&self) -> Result<(), StorageError> {
        match self.tank {
            None | Some(TankState::Empty) => Ok(()),
            Some(TankState::Holding(_)) => Err(StorageError::TankOccupied),
            Some(TankState::Cleaning { until }) => Err(StorageError::TankCleaning(until)),
        }
    }

    /// Record that `inventory` now occupies the tank. No-op for plain areas.
    pub(crate) fn occupy(&mut self, inventory: InventoryId) -> Result<(), StorageError> {
        self.check_accepts_inventory()?;
        if self.tank.is_some() {
            self.tank = Some(TankState::Holding(inventory));
        }
        Ok(())
    }

    /// Release the tank held by `inventory`. Returns the cleanout end tick,
    /// if a cleanout started.
    pub(crate) fn release(&mut self, inventory: InventoryId, now: Ticks) -> Option<Ticks> {
        match self.tank {
            Some(TankState::Holding(held)) if held == inventory => {
                if self.cleanout > 0 {
                    let until = now.saturating_add(self.cleanout);
                    self.tank = Some(TankState::Cleaning { until });
                    Some(until)
                } else {
                    self.tank = Some(TankState::Empty);
                    None
                }
            }
            _ => None,
        }
    }

    /// Finish a cleanout that ends at or before `now`. Returns whether the
    /// tank became empty.
    pub(crate) fn finish_cleanout(&mut self, now: Ticks) -> bool {
        match self.tank {
            Some(TankState::Cleaning { until }) if until <= now => {
                self.tank = Some(TankState::Empty);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.ledger.clear();
        if self.tank.is_some() {
            self.tank = Some(TankState::Empty);
        }
    }
}

// ---------------------------------------------------------------------------
// StorageAreaConnector
// ---------------------------------------------------------------------------

/// A capacity-bounded link moving material between areas (or between an
/// area and the activities it feeds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAreaConnector {
    pub name: String,
    pub from: Option<StorageAreaId>,
    pub to: Option<StorageAreaId>,
    pub ledger: UsageLedger,
}

impl StorageAreaConnector {
    pub fn new(
        name: impl Into<String>,
        from: Option<StorageAreaId>,
        to: Option<StorageAreaId>,
        capacity: Quantity,
    ) -> Self {
        Self {
            name: name.into(),
            from,
            to,
            ledger: UsageLedger::new(capacity),
        }
    }
}
