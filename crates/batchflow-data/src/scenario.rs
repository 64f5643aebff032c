//! Scenario loading from a single file or a scenario directory.
//!
//! A scenario directory holds one list file per entity kind:
//!
//! | Base name     | Required | Contents            |
//! |---------------|----------|---------------------|
//! | `materials`   | no       | [`MaterialData`]    |
//! | `resources`   | yes      | [`ResourceData`]    |
//! | `areas`       | no       | [`AreaData`]        |
//! | `connectors`  | no       | [`ConnectorData`]   |
//! | `lots`        | no       | [`LotData`]         |
//! | `activities`  | yes      | [`ActivityData`]    |
//! | `config`      | no       | [`KernelConfig`]    |
//!
//! Cross-references are checked per file before the kernel is built, so a
//! dangling name is reported against the file that holds it.

use crate::loader::{
    collect_unique, deserialize_file, deserialize_list, find_data_file, require_data_file, resolve_name,
    DataLoadError,
};
use batchflow_core::data_loader::{
    build_kernel, ActivityData, AreaData, ConnectorData, LotData, MaterialData, ResourceData, ScenarioData,
};
use batchflow_core::kernel::Kernel;
use batchflow_core::sim::KernelConfig;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A parsed scenario and its run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedScenario {
    pub data: ScenarioData,
    pub config: KernelConfig,
}

impl LoadedScenario {
    /// Build a fresh kernel for this scenario.
    pub fn build(&self) -> Result<Kernel, DataLoadError> {
        Ok(build_kernel(&self.data, self.config.clone())?)
    }
}

/// Load a whole scenario from one RON, TOML or JSON file.
pub fn load_scenario_file(path: &Path) -> Result<ScenarioData, DataLoadError> {
    let data: ScenarioData = deserialize_file(path)?;
    debug!(file = %path.display(), activities = data.activities.len(), "scenario file loaded");
    Ok(data)
}

/// Load a scenario directory, checking every cross-reference.
pub fn load_scenario_dir(dir: &Path) -> Result<LoadedScenario, DataLoadError> {
    let materials: Listed<MaterialData> = optional_list(dir, "materials")?;
    let resources: Listed<ResourceData> = required_list(dir, "resources")?;
    let areas: Listed<AreaData> = optional_list(dir, "areas")?;
    let connectors: Listed<ConnectorData> = optional_list(dir, "connectors")?;
    let lots: Listed<LotData> = optional_list(dir, "lots")?;
    let activities: Listed<ActivityData> = required_list(dir, "activities")?;
    let config = match find_data_file(dir, "config")? {
        Some(path) => deserialize_file(&path)?,
        None => KernelConfig::default(),
    };

    let material_names = collect_unique(materials.items.iter().map(|m| m.name.as_str()), &materials.file)?;
    let resource_names = collect_unique(resources.items.iter().map(|r| r.name.as_str()), &resources.file)?;
    let area_names = collect_unique(areas.items.iter().map(|a| a.name.as_str()), &areas.file)?;
    let connector_names = collect_unique(connectors.items.iter().map(|c| c.name.as_str()), &connectors.file)?;
    collect_unique(lots.items.iter().map(|l| l.code.as_str()), &lots.file)?;

    for connector in &connectors.items {
        for end in connector.from.iter().chain(connector.to.iter()) {
            resolve_name(&area_names, end, &connectors.file, "area")?;
        }
    }
    for lot in &lots.items {
        resolve_name(&material_names, &lot.material, &lots.file, "material")?;
        if let Some(area) = &lot.area {
            resolve_name(&area_names, area, &lots.file, "area")?;
        }
    }
    let file = &activities.file;
    for activity in &activities.items {
        for candidate in activity.resources.iter().flatten() {
            resolve_name(&resource_names, candidate, file, "resource")?;
        }
        for demand in &activity.materials {
            resolve_name(&material_names, &demand.material, file, "material")?;
            if let Some(area) = &demand.area {
                resolve_name(&area_names, area, file, "area")?;
            }
            if let Some(connector) = &demand.connector {
                resolve_name(&connector_names, connector, file, "connector")?;
            }
        }
        if let Some(output) = &activity.output {
            resolve_name(&material_names, &output.material, file, "material")?;
            if let Some(area) = &output.area {
                resolve_name(&area_names, area, file, "area")?;
            }
            if let Some(connector) = &output.connector {
                resolve_name(&connector_names, connector, file, "connector")?;
            }
        }
    }

    let data = ScenarioData {
        materials: materials.items,
        resources: resources.items,
        areas: areas.items,
        connectors: connectors.items,
        lots: lots.items,
        activities: activities.items,
    };
    info!(
        dir = %dir.display(),
        materials = data.materials.len(),
        resources = data.resources.len(),
        activities = data.activities.len(),
        "scenario directory loaded"
    );
    Ok(LoadedScenario { data, config })
}

/// Load a scenario directory and build its kernel.
pub fn load_kernel_dir(dir: &Path) -> Result<Kernel, DataLoadError> {
    load_scenario_dir(dir)?.build()
}

/// A list read from one file. `file` is the base name when the file is
/// absent, so errors still point somewhere.
struct Listed<T> {
    file: PathBuf,
    items: Vec<T>,
}

fn required_list<T: DeserializeOwned>(dir: &Path, base_name: &str) -> Result<Listed<T>, DataLoadError> {
    let file = require_data_file(dir, base_name)?;
    let items = deserialize_list(&file, base_name)?;
    Ok(Listed { file, items })
}

fn optional_list<T: DeserializeOwned>(dir: &Path, base_name: &str) -> Result<Listed<T>, DataLoadError> {
    match find_data_file(dir, base_name)? {
        Some(file) => {
            let items = deserialize_list(&file, base_name)?;
            Ok(Listed { file, items })
        }
        None => Ok(Listed {
            file: dir.join(base_name),
            items: Vec::new(),
        }),
    }
}
