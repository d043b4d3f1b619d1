//! # Configuration File Loading
//!
//! Loads fixture overrides from a TOML file.

use crate::config::{FixtureConfig, FixtureConfigBuilder, FixtureSettings};
use errors::FixtureError;
use std::path::Path;

/// Load a builder pre-populated from a TOML file.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_toml;
/// use std::path::Path;
///
/// fn main() -> Result<(), errors::FixtureError> {
///     let config = load_from_toml(Path::new("fixture.toml"))?.build()?;
///     Ok(())
/// }
/// ```
///
/// ## File Format
/// ```toml
/// timeout_ms = 30000
/// user = "app"
/// database = "orders"
/// sslmode = "disable"
/// migrations = "file://db/migrations"
/// address_format = "uri"
/// pool_size = 4
/// image = "postgres:16-alpine"
/// ```
pub fn load_from_toml(path: &Path) -> Result<FixtureConfigBuilder, FixtureError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FixtureError::configuration(format!("cannot read {}: {e}", path.display()))
    })?;

    let settings: FixtureSettings = toml::from_str(&contents).map_err(|e| {
        FixtureError::configuration(format!("invalid TOML in {}: {e}", path.display()))
    })?;

    settings.apply(FixtureConfig::builder())
}
