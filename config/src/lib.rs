//! # Fixture Configuration
//!
//! Configuration for containerized database fixtures.
//!
//! This crate provides:
//! - `FixtureConfig`, an immutable value produced by a fluent builder
//! - Environment variable loading (`CANNED_PG_*`)
//! - TOML file loading
//! - Validation with the `validator` crate

pub mod config;
pub mod file_loader;
pub mod loader;
pub mod validation;

pub use config::{
    AddressFormat, FixtureConfig, FixtureConfigBuilder, FixtureSettings, HandleKind, ImageRef,
    MigrationSource, SslMode,
};
pub use file_loader::load_from_toml;
pub use loader::{load_from_env, settings_from_env};
pub use validation::validate;
