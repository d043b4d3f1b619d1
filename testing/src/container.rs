//! Container lifecycle boundary.
//!
//! The fixture only needs three things from a container runtime: start an
//! image and wait for its readiness log line, tell where the exposed port is
//! reachable, and terminate it. Everything else about the runtime stays
//! behind these traits.

use async_trait::async_trait;
use config::{FixtureConfig, ImageRef};
use errors::FixtureError;
use std::collections::BTreeMap;
use std::time::Duration;

pub const POSTGRES_PORT: u16 = 5432;

/// Logged by the postgres entrypoint once the server accepts connections.
/// The official image logs it twice (init server, then real server), which is
/// why readiness is still confirmed with a probe afterwards.
pub const POSTGRES_READY_LOG: &str = "database system is ready to accept connections";

/// What to start: image, exposed port, readiness log line and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: ImageRef,
    pub exposed_port: u16,
    pub ready_log: String,
    pub env: BTreeMap<String, String>,
    /// Upper bound for the runtime's own start wait. `None` keeps the
    /// runtime default.
    pub startup_timeout: Option<Duration>
}

impl ContainerSpec {
    /// Start request for the configured postgres image. Credentials go into the
    /// container environment so a non-default user or database exists by
    /// the time the server is up.
    pub fn postgres(config: &FixtureConfig) -> Self {
        let env = BTreeMap::from([
            ("POSTGRES_USER".to_string(), config.username().to_string()),
            ("POSTGRES_PASSWORD".to_string(), config.password().to_string()),
            ("POSTGRES_DB".to_string(), config.database().to_string()),
        ]);

        Self {
            image: config.image().clone(),
            exposed_port: POSTGRES_PORT,
            ready_log: POSTGRES_READY_LOG.to_string(),
            env,
            startup_timeout: None
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }
}

/// Starts containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    type Container: RunningContainer;

    /// Blocks until the runtime reports the container started. Errors are
    /// fatal to the fixture; this layer never retries.
    async fn start(&self, spec: &ContainerSpec) -> Result<Self::Container, FixtureError>;
}

/// A started container. Lives until [`RunningContainer::terminate`] is called.
#[async_trait]
pub trait RunningContainer: Send + Sync + 'static {
    fn id(&self) -> &str;

    async fn host(&self) -> Result<String, FixtureError>;

    /// Host port mapped to `internal_port` inside the container.
    async fn mapped_port(&self, internal_port: u16) -> Result<u16, FixtureError>;

    async fn terminate(self) -> Result<(), FixtureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_spec_carries_credentials() {
        let config = FixtureConfig::builder()
            .with_user("app")
            .with_password("secret")
            .with_database_name("orders")
            .build()
            .unwrap();
        let spec = ContainerSpec::postgres(&config);

        assert_eq!(spec.image.to_string(), "postgres:16-alpine");
        assert_eq!(spec.exposed_port, 5432);
        assert_eq!(spec.ready_log, POSTGRES_READY_LOG);
        assert_eq!(spec.env["POSTGRES_USER"], "app");
        assert_eq!(spec.env["POSTGRES_PASSWORD"], "secret");
        assert_eq!(spec.env["POSTGRES_DB"], "orders");
        assert_eq!(spec.startup_timeout, None);
    }

    #[test]
    fn test_startup_timeout_override() {
        let spec = ContainerSpec::postgres(&FixtureConfig::default())
            .with_startup_timeout(Duration::from_secs(90));
        assert_eq!(spec.startup_timeout, Some(Duration::from_secs(90)));
    }
}
