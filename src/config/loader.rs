// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::model::{Backlog, RawRunConfig, RunConfig};
use crate::config::validate::flatten_backlog;
use crate::dag::{DependencyResolver, GraphStore};
use crate::errors::{ErrorCode, ExecutionError, PlanError, Result};

/// Load a run configuration file and return the raw `RawRunConfig`.
///
/// This only performs TOML deserialization; it does **not** validate
/// durations or ranges. Use [`load_run_config`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawRunConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawRunConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load and validate the run configuration.
///
/// - An explicit `path` must exist (`CONFIG_MISSING` otherwise).
/// - Without a path, [`default_config_path`] is used if present; otherwise
///   the built-in defaults apply.
pub fn load_run_config(path: Option<&Path>) -> Result<RunConfig> {
    let path = match path {
        Some(p) if !p.exists() => {
            return Err(ExecutionError::new(
                ErrorCode::ConfigMissing,
                format!("config file '{}' does not exist", p.display()),
            )
            .into());
        }
        Some(p) => p.to_path_buf(),
        None => {
            let default = default_config_path();
            if !default.exists() {
                debug!("no config file found; using defaults");
                return Ok(RunConfig::default());
            }
            default
        }
    };

    info!(path = %path.display(), "loading run config");
    let raw = load_from_path(&path)?;
    RunConfig::try_from(raw)
}

/// Load the hierarchy document and build a validated graph.
///
/// Fails on malformed documents, bad ids or story points, duplicate ids,
/// unknown dependencies and dependency cycles.
pub fn load_hierarchy(path: impl AsRef<Path>) -> Result<GraphStore> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        PlanError::Config(format!("reading hierarchy '{}': {e}", path.display()))
    })?;
    parse_hierarchy(&contents)
}

/// Same as [`load_hierarchy`], from an in-memory JSON document.
pub fn parse_hierarchy(json: &str) -> Result<GraphStore> {
    let doc: Backlog = serde_json::from_str(json)?;
    let items = flatten_backlog(doc)?;
    let graph = GraphStore::from_items(items)?;
    DependencyResolver::resolve(&graph)?;
    info!(items = graph.len(), "hierarchy loaded");
    Ok(graph)
}

/// Default run config location: `Plandag.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Plandag.toml")
}
