//! Container test fixture: one ready database per test.

use crate::address::build_address;
use crate::container::{ContainerRuntime, ContainerSpec, RunningContainer};
use crate::docker::{DockerContainer, DockerRuntime};
use crate::driver::{Driver, PostgresDriver};
use crate::migrate::MigrationOutcome;
use crate::readiness::{Deadline, ProbePolicy, ReadinessPoller};
use crate::telemetry::Telemetry;
use config::FixtureConfig;
use errors::FixtureError;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Context returned by the Docker/sqlx fixture.
pub type PostgresContext = FixtureContext<DockerContainer, PostgresDriver>;

/// Starts a database container and hands back a ready handle.
///
/// ```rust,no_run
/// use canned_containers::ContainerFixture;
/// use config::FixtureConfig;
///
/// # async fn run() -> Result<(), errors::FixtureError> {
/// let fixture = ContainerFixture::postgres(FixtureConfig::default());
/// let mut ctx = fixture.setup().await?;
/// ctx.execute("CREATE TABLE t (id INT)").await.ok();
/// ctx.teardown().await;
/// # Ok(())
/// # }
/// ```
pub struct ContainerFixture<R = DockerRuntime, D = PostgresDriver> {
    config: FixtureConfig,
    runtime: R,
    driver: Arc<D>,
    policy: ProbePolicy
}

impl ContainerFixture<DockerRuntime, PostgresDriver> {
    pub fn postgres(config: FixtureConfig) -> Self {
        Self::with_components(config, DockerRuntime, PostgresDriver)
    }
}

impl<R, D> ContainerFixture<R, D>
where
    R: ContainerRuntime,
    D: Driver
{
    pub fn with_components(config: FixtureConfig, runtime: R, driver: D) -> Self {
        Self {
            config,
            runtime,
            driver: Arc::new(driver),
            policy: ProbePolicy::default()
        }
    }

    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    /// Start the container, wait for the database and apply migrations.
    ///
    /// The configured timeout covers the whole call, container start
    /// included: a start still running when it fires fails with
    /// [`FixtureError::StartTimeout`]. On any failure after the container
    /// started, it is terminated before the error is returned.
    #[instrument(skip_all, fields(image = %self.config.image(), timeout_ms = self.config.timeout().as_millis() as u64))]
    pub async fn setup(&self) -> Result<FixtureContext<R::Container, D>, FixtureError> {
        let started = Instant::now();
        let deadline = Deadline::arm(self.config.timeout());

        let result = self.start_and_connect(&deadline).await;
        Telemetry::record_setup(result.as_ref().err().map(FixtureError::stage), started.elapsed());
        result
    }

    async fn start_and_connect(
        &self,
        deadline: &Deadline
    ) -> Result<FixtureContext<R::Container, D>, FixtureError> {
        let container = self.start_container(deadline).await?;

        match self.connect(&container, deadline).await {
            Ok((handle, address, migrations)) => {
                info!(container = container.id(), "Fixture ready");
                Ok(FixtureContext {
                    handle,
                    container,
                    address,
                    migrations,
                    driver: Arc::clone(&self.driver),
                    cancel: CancellationToken::new()
                })
            }
            Err(e) => {
                warn!(container = container.id(), error = %e, "Setup failed, terminating container");
                if let Err(cleanup) = container.terminate().await {
                    warn!(error = %cleanup, "Failed to terminate container after setup failure");
                }
                Err(e)
            }
        }
    }

    /// The runtime gets the remaining budget as its own start timeout, and
    /// the start is abandoned if the deadline fires first.
    async fn start_container(&self, deadline: &Deadline) -> Result<R::Container, FixtureError> {
        let spec = ContainerSpec::postgres(&self.config).with_startup_timeout(deadline.remaining());
        let timed_out = || FixtureError::StartTimeout {
            image: spec.image.to_string(),
            timeout: deadline.timeout()
        };
        if deadline.is_expired() {
            return Err(timed_out());
        }

        tokio::select! {
            biased;
            started = self.runtime.start(&spec) => started,
            () = deadline.token().cancelled() => {
                warn!(image = %spec.image, "Deadline fired while the container was starting");
                Err(timed_out())
            }
        }
    }

    async fn connect(
        &self,
        container: &R::Container,
        deadline: &Deadline
    ) -> Result<(D::Handle, String, Option<MigrationOutcome>), FixtureError> {
        let host = container.host().await?;
        let port = container.mapped_port(crate::container::POSTGRES_PORT).await?;
        let address = build_address(&self.config, &host, port)?;

        let poller = ReadinessPoller::new(Arc::clone(&self.driver), self.policy);
        let mut handle = poller
            .wait_until_ready(&address, self.config.handle_kind(), deadline)
            .await?;

        let Some(source) = self.config.migration_source() else {
            return Ok((handle, address, None));
        };

        match self.driver.apply_migrations(&mut handle, source).await {
            Ok(outcome) => {
                info!(source = %source, applied = outcome.applied(), "Migrations applied");
                Ok((handle, address, Some(outcome)))
            }
            Err(e) => {
                if let Err(close) = self.driver.close(handle).await {
                    warn!(error = %close, "Failed to close handle after migration failure");
                }
                Err(e)
            }
        }
    }
}

/// A ready database handle plus what is needed to tear it down.
///
/// Derefs to the driver handle. Resources are released only by
/// [`FixtureContext::teardown`].
pub struct FixtureContext<C: RunningContainer, D: Driver> {
    handle: D::Handle,
    container: C,
    address: String,
    migrations: Option<MigrationOutcome>,
    driver: Arc<D>,
    cancel: CancellationToken
}

impl<C: RunningContainer, D: Driver> FixtureContext<C, D> {
    pub fn handle(&self) -> &D::Handle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut D::Handle {
        &mut self.handle
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    /// Address the handle was opened with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// `None` when no migration source was configured.
    pub fn migration_outcome(&self) -> Option<MigrationOutcome> {
        self.migrations
    }

    /// Cancelled when the fixture is torn down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn ping(&mut self) -> Result<(), D::Error> {
        self.driver.ping(&mut self.handle).await
    }

    /// Close the handle and terminate the container. Errors are logged,
    /// never returned.
    pub async fn teardown(self) {
        let FixtureContext {
            handle,
            container,
            driver,
            cancel,
            ..
        } = self;
        cancel.cancel();

        let mut clean = true;
        if let Err(e) = driver.close(handle).await {
            warn!(error = %e, "Failed to close database handle");
            clean = false;
        }

        let id = container.id().to_string();
        match container.terminate().await {
            Ok(()) => info!(container = %id, "Fixture torn down"),
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to terminate container");
                clean = false;
            }
        }
        Telemetry::record_teardown(clean);
    }
}

impl<C: RunningContainer, D: Driver> Deref for FixtureContext<C, D> {
    type Target = D::Handle;

    fn deref(&self) -> &D::Handle {
        &self.handle
    }
}

impl<C: RunningContainer, D: Driver> DerefMut for FixtureContext<C, D> {
    fn deref_mut(&mut self) -> &mut D::Handle {
        &mut self.handle
    }
}
