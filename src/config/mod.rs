// src/config/mod.rs

//! Configuration and hierarchy loading for plandag.
//!
//! Responsibilities:
//! - Define the TOML run config and the JSON hierarchy model (`model.rs`).
//! - Load both from disk (`loader.rs`).
//! - Validate them and convert raw into checked values (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_from_path, load_hierarchy, load_run_config, parse_hierarchy};
pub use model::{Backlog, ItemDoc, RawRunConfig, RunConfig};
pub use validate::{flatten_backlog, parse_duration};
