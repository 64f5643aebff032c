//! File-based scenario loading for the batchflow kernel.
//!
//! A scenario lives either in one file or in a directory with one file per
//! entity kind. Each file may be RON, TOML or JSON, chosen by extension.

pub mod loader;
pub mod scenario;

pub use loader::{DataLoadError, Format};
pub use scenario::{load_kernel_dir, load_scenario_dir, load_scenario_file, LoadedScenario};
