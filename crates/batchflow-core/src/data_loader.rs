//! Data-driven scenario loading from JSON.
//!
//! Feature-gated behind `data-loader`. A [`ScenarioData`] names every entity
//! and refers to other entities by name; [`build_kernel`] resolves the names
//! into arena ids and adds everything to a fresh [`Kernel`].

use crate::activity::{Activity, OutputSpec, ResourceRequirement};
use crate::block::Spans;
use crate::fixed::{Quantity, Ticks};
use crate::id::*;
use crate::kernel::{Kernel, KernelError};
use crate::material::{Lot, MaterialDef, MaterialRequirement, TransferPolicy, Usability};
use crate::reservation::Resource;
use crate::sim::KernelConfig;
use crate::storage::{StorageArea, StorageAreaConnector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while turning scenario data into a kernel.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("unresolved {kind} reference '{name}'")]
    UnresolvedRef { kind: &'static str, name: String },
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },
    #[error("quantity {value} of {context} is out of range")]
    InvalidQuantity { context: String, value: f64 },
    #[error("invalid scenario: {0}")]
    Kernel(#[from] KernelError),
}

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A complete scenario: the initial entity graph of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioData {
    #[serde(default)]
    pub materials: Vec<MaterialData>,
    #[serde(default)]
    pub resources: Vec<ResourceData>,
    #[serde(default)]
    pub areas: Vec<AreaData>,
    #[serde(default)]
    pub connectors: Vec<ConnectorData>,
    #[serde(default)]
    pub lots: Vec<LotData>,
    #[serde(default)]
    pub activities: Vec<ActivityData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialData {
    pub name: String,
    #[serde(default)]
    pub shelf_life: Option<Ticks>,
    /// Release output incrementally every `transfer_step` ticks.
    #[serde(default)]
    pub transfer_step: Option<Ticks>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    pub name: String,
    /// Batch capacity. Absent for single resources.
    #[serde(default)]
    pub multitasking: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaData {
    pub name: String,
    pub capacity: f64,
    #[serde(default)]
    pub tank: bool,
    #[serde(default)]
    pub cleanout: Ticks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorData {
    pub name: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub capacity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotData {
    pub code: String,
    pub material: String,
    pub quantity: f64,
    #[serde(default)]
    pub produced_at: Ticks,
    #[serde(default)]
    pub expires_at: Option<Ticks>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsabilityData {
    Wear {
        max_uses: u32,
    },
    ShelfLife {
        #[serde(default)]
        min_remaining: Ticks,
        #[serde(default)]
        eligible: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandData {
    pub material: String,
    pub quantity: f64,
    #[serde(default)]
    pub usability: Option<UsabilityData>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub connector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    pub material: String,
    pub quantity: f64,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub connector: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    pub job: u32,
    pub order: u32,
    pub operation: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub release: Ticks,
    #[serde(default)]
    pub setup: Ticks,
    pub run: Ticks,
    #[serde(default)]
    pub post_processing: Ticks,
    #[serde(default)]
    pub clean: Ticks,
    #[serde(default)]
    pub storage: Ticks,
    /// One candidate list per resource requirement.
    #[serde(default)]
    pub resources: Vec<Vec<String>>,
    #[serde(default)]
    pub materials: Vec<DemandData>,
    #[serde(default)]
    pub output: Option<OutputData>,
}

// ---------------------------------------------------------------------------
// Loading functions
// ---------------------------------------------------------------------------

/// Load a scenario from a JSON string and build its kernel.
pub fn load_scenario_json(json: &str, config: KernelConfig) -> Result<Kernel, ScenarioError> {
    let data: ScenarioData = serde_json::from_str(json)?;
    build_kernel(&data, config)
}

/// Load a scenario from JSON bytes and build its kernel.
pub fn load_scenario_json_bytes(bytes: &[u8], config: KernelConfig) -> Result<Kernel, ScenarioError> {
    let data: ScenarioData = serde_json::from_slice(bytes)?;
    build_kernel(&data, config)
}

/// Name to id, rejecting duplicates.
struct Names<T> {
    kind: &'static str,
    ids: HashMap<String, T>,
}

impl<T: Copy> Names<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ids: HashMap::new(),
        }
    }

    fn insert(&mut self, name: &str, id: T) -> Result<(), ScenarioError> {
        if self.ids.insert(name.to_string(), id).is_some() {
            return Err(ScenarioError::DuplicateName {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_new(&self, name: &str) -> Result<(), ScenarioError> {
        if self.ids.contains_key(name) {
            return Err(ScenarioError::DuplicateName {
                kind: self.kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn get(&self, name: &str) -> Result<T, ScenarioError> {
        self.ids.get(name).copied().ok_or_else(|| ScenarioError::UnresolvedRef {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    fn get_opt(&self, name: Option<&String>) -> Result<Option<T>, ScenarioError> {
        name.map(|n| self.get(n)).transpose()
    }
}

fn quantity(value: f64, context: impl FnOnce() -> String) -> Result<Quantity, ScenarioError> {
    Quantity::checked_from_num(value)
        .filter(|_| value.is_finite())
        .ok_or_else(|| ScenarioError::InvalidQuantity {
            context: context(),
            value,
        })
}

/// Resolve names and add every entity of `data` to a new kernel.
pub fn build_kernel(data: &ScenarioData, config: KernelConfig) -> Result<Kernel, ScenarioError> {
    let mut kernel = Kernel::new(config);

    // Phase 1: entities without references.
    let mut materials = Names::new("material");
    for m in &data.materials {
        materials.check_new(&m.name)?;
        let mut def = MaterialDef::new(&m.name);
        def.shelf_life = m.shelf_life;
        if let Some(step) = m.transfer_step {
            def = def.with_transfer(TransferPolicy::Incremental { step });
        }
        materials.insert(&m.name, kernel.add_material(def))?;
    }

    let mut resources = Names::new("resource");
    for r in &data.resources {
        resources.check_new(&r.name)?;
        let resource = match r.multitasking {
            Some(capacity) => Resource::multitasking(&r.name, capacity),
            None => Resource::single(&r.name),
        };
        resources.insert(&r.name, kernel.add_resource(resource))?;
    }

    let mut areas = Names::new("storage area");
    for a in &data.areas {
        areas.check_new(&a.name)?;
        let capacity = quantity(a.capacity, || format!("area {}", a.name))?;
        let area = if a.tank {
            StorageArea::tank(&a.name, capacity, a.cleanout)
        } else {
            StorageArea::new(&a.name, capacity)
        };
        areas.insert(&a.name, kernel.add_area(area))?;
    }

    // Phase 2: entities referring to phase 1 by name.
    let mut connectors = Names::new("connector");
    for c in &data.connectors {
        connectors.check_new(&c.name)?;
        let connector = StorageAreaConnector::new(
            &c.name,
            areas.get_opt(c.from.as_ref())?,
            areas.get_opt(c.to.as_ref())?,
            quantity(c.capacity, || format!("connector {}", c.name))?,
        );
        connectors.insert(&c.name, kernel.add_connector(connector)?)?;
    }

    let mut codes = Names::new("lot");
    for l in &data.lots {
        codes.check_new(&l.code)?;
        let mut lot = Lot::on_hand(
            &l.code,
            materials.get(&l.material)?,
            quantity(l.quantity, || format!("lot {}", l.code))?,
            l.produced_at,
        );
        if let Some(expires_at) = l.expires_at {
            lot = lot.with_expiry(expires_at);
        }
        if let Some(area) = areas.get_opt(l.area.as_ref())? {
            lot = lot.at(area);
        }
        for tag in &l.tags {
            lot = lot.with_tag(tag);
        }
        codes.insert(&l.code, kernel.add_lot(lot)?)?;
    }

    // Phase 3: activities.
    for a in &data.activities {
        let key = ActivityKey::new(a.job, a.order, a.operation);
        let name = a.name.clone().unwrap_or_else(|| key.to_string());
        let spans = Spans::new(a.setup, a.run, a.post_processing, a.clean, a.storage);
        let mut activity = Activity::new(key, name, spans).released_at(a.release);

        for candidates in &a.resources {
            let ids = candidates
                .iter()
                .map(|n| resources.get(n))
                .collect::<Result<Vec<_>, _>>()?;
            activity = activity.requires(ResourceRequirement::any_of(ids));
        }

        for d in &a.materials {
            let mut req = MaterialRequirement::new(
                materials.get(&d.material)?,
                quantity(d.quantity, || format!("activity {key} demand"))?,
            );
            if let Some(usability) = &d.usability {
                req = req.with_usability(match usability {
                    UsabilityData::Wear { max_uses } => Usability::Wear { max_uses: *max_uses },
                    UsabilityData::ShelfLife {
                        min_remaining,
                        eligible,
                    } => Usability::ShelfLife {
                        min_remaining: *min_remaining,
                        eligible: eligible
                            .as_ref()
                            .map(|codes| codes.iter().map(LotCode::new).collect()),
                    },
                });
            }
            req.source = areas.get_opt(d.area.as_ref())?;
            req.connector = connectors.get_opt(d.connector.as_ref())?;
            for tag in &d.tags {
                req = req.with_tag(tag);
            }
            activity = activity.consumes(req);
        }

        if let Some(o) = &a.output {
            let mut out = OutputSpec::new(
                materials.get(&o.material)?,
                quantity(o.quantity, || format!("activity {key} output"))?,
            );
            out.storage = areas.get_opt(o.area.as_ref())?;
            out.connector = connectors.get_opt(o.connector.as_ref())?;
            for tag in &o.tags {
                out = out.with_tag(tag);
            }
            activity = activity.produces(out);
        }

        kernel.add_activity(activity)?;
    }

    Ok(kernel)
}

// ===========================================================================
// Tests
// ===========================================================================
