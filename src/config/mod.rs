// src/config/mod.rs

//! Configuration loading and validation for dwiprep.
//!
//! - `model.rs`: the TOML-backed data model and the validated `ConfigFile`.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: `RawConfigFile -> ConfigFile` conversion.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default};
pub use model::{
    CheckpointSection, ConfigFile, DenoiseSection, EddySection, EnvironmentSection, FailurePolicy, GibbsSection,
    LeaseSection, NotifySection, PathsSection, PipelineSection, RawConfigFile, RunSection,
    StageSection, TopupSection,
};
pub use validate::validate_config;
