//! # Environment Variable Loader
//!
//! Reads fixture overrides from `CANNED_PG_*` environment variables so a CI
//! job can stretch the readiness timeout or swap the image without touching
//! test code.

use crate::config::{AddressFormat, FixtureConfig, FixtureConfigBuilder, FixtureSettings, SslMode};
use errors::FixtureError;
use std::env;
use std::str::FromStr;

pub const ENV_TIMEOUT_MS: &str = "CANNED_PG_TIMEOUT_MS";
pub const ENV_USER: &str = "CANNED_PG_USER";
pub const ENV_PASSWORD: &str = "CANNED_PG_PASSWORD";
pub const ENV_DATABASE: &str = "CANNED_PG_DATABASE";
pub const ENV_SSLMODE: &str = "CANNED_PG_SSLMODE";
pub const ENV_MIGRATIONS: &str = "CANNED_PG_MIGRATIONS";
pub const ENV_ADDRESS_FORMAT: &str = "CANNED_PG_ADDRESS_FORMAT";
pub const ENV_POOL_SIZE: &str = "CANNED_PG_POOL_SIZE";
pub const ENV_IMAGE: &str = "CANNED_PG_IMAGE";

/// Load a builder pre-populated from environment variables.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_env;
/// use std::time::Duration;
///
/// fn main() -> Result<(), errors::FixtureError> {
///     // Explicit setters still win over the environment.
///     let config = load_from_env()?.with_database_name("orders").build()?;
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables
/// - `CANNED_PG_TIMEOUT_MS`: readiness deadline in milliseconds (default: 10000)
/// - `CANNED_PG_USER`: database user (default: "postgres")
/// - `CANNED_PG_PASSWORD`: database password (default: "postgres")
/// - `CANNED_PG_DATABASE`: database name (default: "postgres")
/// - `CANNED_PG_SSLMODE`: disable/allow/prefer/require/verify-ca/verify-full
/// - `CANNED_PG_MIGRATIONS`: migration directory, `file://` prefix optional
/// - `CANNED_PG_ADDRESS_FORMAT`: key-value/uri (default: key-value)
/// - `CANNED_PG_POOL_SIZE`: hand out a pool of this size instead of a single
///   connection
/// - `CANNED_PG_IMAGE`: container image as `name:tag`
pub fn load_from_env() -> Result<FixtureConfigBuilder, FixtureError> {
    settings_from_env()?.apply(FixtureConfig::builder())
}

/// Read the environment into an overlay without applying it.
pub fn settings_from_env() -> Result<FixtureSettings, FixtureError> {
    Ok(FixtureSettings {
        timeout_ms: parse_env::<u64>(ENV_TIMEOUT_MS)?,
        user: env::var(ENV_USER).ok(),
        password: env::var(ENV_PASSWORD).ok(),
        database: env::var(ENV_DATABASE).ok(),
        sslmode: parse_env::<SslMode>(ENV_SSLMODE)?,
        migrations: env::var(ENV_MIGRATIONS).ok(),
        address_format: parse_env::<AddressFormat>(ENV_ADDRESS_FORMAT)?,
        pool_size: parse_env::<u32>(ENV_POOL_SIZE)?,
        image: env::var(ENV_IMAGE).ok()
    })
}

fn parse_env<T>(key: &str) -> Result<Option<T>, FixtureError>
where
    T: FromStr,
    T::Err: std::fmt::Display
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| FixtureError::configuration(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandleKind;
    use serial_test::serial;
    use std::path::Path;
    use std::time::Duration;

    const ALL: [&str; 9] = [
        ENV_TIMEOUT_MS,
        ENV_USER,
        ENV_PASSWORD,
        ENV_DATABASE,
        ENV_SSLMODE,
        ENV_MIGRATIONS,
        ENV_ADDRESS_FORMAT,
        ENV_POOL_SIZE,
        ENV_IMAGE
    ];

    fn clear_env() {
        for key in ALL {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_load_from_env_defaults() {
        clear_env();
        let config = load_from_env().unwrap().build().unwrap();
        assert_eq!(config, FixtureConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_env_overrides() {
        clear_env();
        unsafe {
            env::set_var(ENV_TIMEOUT_MS, "2500");
            env::set_var(ENV_USER, "ci");
            env::set_var(ENV_DATABASE, "ci_db");
            env::set_var(ENV_SSLMODE, "require");
            env::set_var(ENV_MIGRATIONS, "file://db/migrations");
            env::set_var(ENV_ADDRESS_FORMAT, "uri");
            env::set_var(ENV_POOL_SIZE, "3");
            env::set_var(ENV_IMAGE, "postgres:15");
        }

        let config = load_from_env().unwrap().build().unwrap();
        clear_env();

        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.username(), "ci");
        assert_eq!(config.database(), "ci_db");
        assert_eq!(config.ssl_mode(), SslMode::Require);
        assert_eq!(
            config.migration_source().unwrap().path(),
            Path::new("db/migrations")
        );
        assert_eq!(config.address_format(), AddressFormat::Uri);
        assert_eq!(config.handle_kind(), HandleKind::pool(3));
        assert_eq!(config.image().tag, "15");
    }

    #[test]
    #[serial]
    fn test_explicit_setter_beats_env() {
        clear_env();
        unsafe {
            env::set_var(ENV_USER, "from_env");
        }
        let config = load_from_env()
            .unwrap()
            .with_user("explicit")
            .build()
            .unwrap();
        clear_env();
        assert_eq!(config.username(), "explicit");
    }

    #[test]
    #[serial]
    fn test_unparseable_env_is_configuration_error() {
        clear_env();
        unsafe {
            env::set_var(ENV_TIMEOUT_MS, "soon");
        }
        let err = load_from_env().unwrap_err();
        clear_env();
        assert!(err.to_string().contains(ENV_TIMEOUT_MS));
    }
}
