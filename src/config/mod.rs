// src/config/mod.rs

//! Configuration loading and validation for slotdag.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate and convert it into typed settings (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    AgentPoolConfig, ConfigFile, DispatcherConfig, RawConfigFile, RawDispatcherSection,
    RawPoolSection, RawRegistrySection, RawSlotsSection, RegistryConfig, RoutingConfig,
};
pub use validate::validate_config;
