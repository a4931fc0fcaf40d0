// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs` defines the TOML-backed data model.
//! - `loader.rs` reads a config file from disk.
//! - `validate.rs` turns a raw config into a validated [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default, parse_str};
pub use model::{
    BudgetSection, ClassBudget, ConfigFile, DispatchSection, JobConfig, RawConfigFile,
    RetrySection,
};
