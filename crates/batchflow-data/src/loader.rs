//! Format detection, file discovery and deserialization helpers shared by
//! the scenario loaders.

use batchflow_core::data_loader::ScenarioError;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur while loading scenario files.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// `resources` or `activities` is absent from a scenario directory.
    #[error("scenario file '{file}' missing from {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// Extension other than `.ron`, `.toml` or `.json`.
    #[error("{file}: expected a .ron, .toml or .json file")]
    UnsupportedFormat { file: PathBuf },

    /// The same entity kind is present in more than one format.
    #[error("{a} and {b} describe the same entities")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    #[error("cannot parse {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A referenced name is not defined by any scenario file.
    #[error("{file} refers to unknown {expected_kind} '{name}'")]
    UnresolvedRef {
        file: PathBuf,
        name: String,
        expected_kind: &'static str,
    },

    #[error("{file} defines '{name}' twice")]
    DuplicateName { file: PathBuf, name: String },

    /// The parsed scenario could not be built into a kernel.
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Scenario file formats, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name.
///
/// Looks for `{base_name}.ron`, `{base_name}.toml` and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// more than one format exists for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let mut found: Option<PathBuf> = None;

    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but a missing file is an error.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, detail: impl ToString) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Deserialize a string in the given format.
pub fn deserialize_str<T: DeserializeOwned>(content: &str, format: Format, path: &Path) -> Result<T, DataLoadError> {
    match format {
        Format::Ron => ron::from_str(content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(content).map_err(|e| parse_error(path, e)),
    }
}

/// Read a file and deserialize it according to its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    deserialize_str(&content, format, path)
}

/// Deserialize a list from a file. TOML has no top-level arrays, so the list
/// is read from the array at `toml_key`; RON and JSON hold a bare list.
pub fn deserialize_list<T: DeserializeOwned>(path: &Path, toml_key: &str) -> Result<Vec<T>, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron | Format::Json => deserialize_str(&content, format, path),
        Format::Toml => {
            let table: toml::Table = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?
                .clone();
            array.try_into().map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

// ===========================================================================
// Name checks
// ===========================================================================

/// Check that `name` is in `known`, returning an `UnresolvedRef` error that
/// names the referring file if not.
pub fn resolve_name(
    known: &HashSet<&str>,
    name: &str,
    file: &Path,
    expected_kind: &'static str,
) -> Result<(), DataLoadError> {
    if known.contains(name) {
        Ok(())
    } else {
        Err(DataLoadError::UnresolvedRef {
            file: file.to_path_buf(),
            name: name.to_string(),
            expected_kind,
        })
    }
}

/// Collect names into a set, rejecting the first duplicate.
pub fn collect_unique<'a>(
    names: impl IntoIterator<Item = &'a str>,
    file: &Path,
) -> Result<HashSet<&'a str>, DataLoadError> {
    let mut set = HashSet::new();
    for name in names {
        if !set.insert(name) {
            return Err(DataLoadError::DuplicateName {
                file: file.to_path_buf(),
                name: name.to_string(),
            });
        }
    }
    Ok(set)
}

// ===========================================================================
// Tests
// ===========================================================================
