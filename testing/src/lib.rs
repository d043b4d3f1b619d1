//! Ephemeral PostgreSQL containers for tests.
//!
//! [`ContainerFixture::setup`] starts a container, waits until the database
//! answers, optionally applies migrations, and returns a [`FixtureContext`]
//! that derefs to a live handle. Call [`FixtureContext::teardown`] when the
//! test is done.
//!
//! The Docker runtime and the sqlx driver are the defaults; the simulated
//! pair in [`simulated`] runs the same fixture in-process.

mod address;
mod container;
mod docker;
mod driver;
mod fixture;
mod migrate;
mod readiness;
pub mod simulated;
mod telemetry;

pub use address::{ConnectionParams, DEFAULT_PORT, build_address};
pub use container::{
    ContainerRuntime, ContainerSpec, POSTGRES_PORT, POSTGRES_READY_LOG, RunningContainer
};
pub use docker::{DockerContainer, DockerRuntime};
pub use driver::{Driver, PgHandle, PostgresDriver};
pub use fixture::{ContainerFixture, FixtureContext, PostgresContext};
pub use migrate::MigrationOutcome;
pub use readiness::{Deadline, ProbePolicy, ProbeReport, ReadinessPoller};

/// Install a `fmt` subscriber that writes through the test harness, filtered
/// by `RUST_LOG`. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
