//! In-process container runtime and driver.
//!
//! Lets fixture behaviour (timeouts, cleanup on failure, migrations) be
//! tested without Docker. A [`SimulatedCluster`] holds the shared state that
//! the runtime writes and the driver reads, and that tests inspect.

use crate::address::ConnectionParams;
use crate::container::{ContainerRuntime, ContainerSpec, RunningContainer};
use crate::driver::Driver;
use crate::migrate::MigrationOutcome;
use async_trait::async_trait;
use config::{HandleKind, MigrationSource};
use dashmap::DashMap;
use errors::FixtureError;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const FIRST_HOST_PORT: u16 = 40000;

static CONTAINER_COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn unique_id(prefix: &str) -> String {
    let id = CONTAINER_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", prefix, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Terminated
}

#[derive(Debug)]
struct SimulatedServer {
    status: ContainerStatus,
    host_port: u16,
    ready_at: Instant,
    user: String,
    password: String,
    database: String,
    applied: BTreeSet<String>
}

impl SimulatedServer {
    fn accepts_queries(&self) -> bool {
        self.status == ContainerStatus::Running && Instant::now() >= self.ready_at
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    servers: DashMap<String, SimulatedServer>,
    ports: DashMap<u16, String>,
    next_port: AtomicU16,
    probes: AtomicU32,
    open_handles: AtomicU32
}

/// Shared state behind a [`SimulatedRuntime`] / [`SimulatedDriver`] pair.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<ClusterState>
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, container_id: &str) -> Option<ContainerStatus> {
        self.state.servers.get(container_id).map(|s| s.status)
    }

    pub fn running_containers(&self) -> usize {
        self.state
            .servers
            .iter()
            .filter(|s| s.status == ContainerStatus::Running)
            .count()
    }

    pub fn started_containers(&self) -> usize {
        self.state.servers.len()
    }

    /// Every `open` and `ping` the driver has served.
    pub fn probe_count(&self) -> u32 {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> u32 {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    pub fn applied_migrations(&self, container_id: &str) -> Vec<String> {
        self.state
            .servers
            .get(container_id)
            .map(|s| s.applied.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn allocate_port(&self) -> u16 {
        FIRST_HOST_PORT + self.state.next_port.fetch_add(1, Ordering::SeqCst)
    }

    fn server_id_for(&self, port: u16) -> Option<String> {
        self.state.ports.get(&port).map(|id| id.clone())
    }
}

/// Starts simulated postgres servers that accept queries `boot_time` after
/// start returns.
#[derive(Debug, Clone)]
pub struct SimulatedRuntime {
    cluster: SimulatedCluster,
    boot_time: Duration,
    start_latency: Duration,
    start_failure: Option<String>,
    terminate_failure: Option<String>
}

impl SimulatedRuntime {
    pub fn new(cluster: &SimulatedCluster) -> Self {
        Self {
            cluster: cluster.clone(),
            boot_time: Duration::ZERO,
            start_latency: Duration::ZERO,
            start_failure: None,
            terminate_failure: None
        }
    }

    pub fn with_boot_time(mut self, boot_time: Duration) -> Self {
        self.boot_time = boot_time;
        self
    }

    pub fn with_start_latency(mut self, latency: Duration) -> Self {
        self.start_latency = latency;
        self
    }

    pub fn failing_start(mut self, reason: impl Into<String>) -> Self {
        self.start_failure = Some(reason.into());
        self
    }

    /// Containers from this runtime refuse to terminate and stay running.
    pub fn failing_terminate(mut self, reason: impl Into<String>) -> Self {
        self.terminate_failure = Some(reason.into());
        self
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    type Container = SimulatedContainer;

    async fn start(&self, spec: &ContainerSpec) -> Result<SimulatedContainer, FixtureError> {
        if !self.start_latency.is_zero() {
            tokio::time::sleep(self.start_latency).await;
        }
        if let Some(reason) = &self.start_failure {
            return Err(FixtureError::ContainerStart {
                image: spec.image.to_string(),
                reason: reason.clone()
            });
        }

        let env = |key: &str| spec.env.get(key).cloned().unwrap_or_default();
        let id = unique_id("sim");
        let host_port = self.cluster.allocate_port();

        self.cluster.state.servers.insert(
            id.clone(),
            SimulatedServer {
                status: ContainerStatus::Running,
                host_port,
                ready_at: Instant::now() + self.boot_time,
                user: env("POSTGRES_USER"),
                password: env("POSTGRES_PASSWORD"),
                database: env("POSTGRES_DB"),
                applied: BTreeSet::new()
            }
        );
        self.cluster.state.ports.insert(host_port, id.clone());
        tracing::debug!(container = %id, port = host_port, "Simulated container started");

        Ok(SimulatedContainer {
            id,
            exposed_port: spec.exposed_port,
            host_port,
            terminate_failure: self.terminate_failure.clone(),
            cluster: self.cluster.clone()
        })
    }
}

#[derive(Debug)]
pub struct SimulatedContainer {
    id: String,
    exposed_port: u16,
    host_port: u16,
    terminate_failure: Option<String>,
    cluster: SimulatedCluster
}

#[async_trait]
impl RunningContainer for SimulatedContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn host(&self) -> Result<String, FixtureError> {
        Ok("127.0.0.1".to_string())
    }

    async fn mapped_port(&self, internal_port: u16) -> Result<u16, FixtureError> {
        if internal_port != self.exposed_port {
            return Err(FixtureError::Discovery {
                what: format!("port {internal_port} of {}", self.id),
                reason: "port is not exposed".to_string()
            });
        }
        Ok(self.host_port)
    }

    async fn terminate(self) -> Result<(), FixtureError> {
        if let Some(reason) = self.terminate_failure {
            return Err(FixtureError::Teardown {
                resource: format!("container {}", self.id),
                reason
            });
        }
        let mut server = self
            .cluster
            .state
            .servers
            .get_mut(&self.id)
            .ok_or_else(|| FixtureError::Teardown {
                resource: format!("container {}", self.id),
                reason: "unknown container".to_string()
            })?;
        server.status = ContainerStatus::Terminated;
        self.cluster.state.ports.remove(&server.host_port);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulatedError {
    #[error("connection refused on port {port}")]
    ConnectionRefused { port: u16 },

    #[error("the database system is starting up")]
    Starting,

    #[error("password authentication failed for user \"{user}\"")]
    AuthenticationFailed { user: String },

    #[error("database \"{database}\" does not exist")]
    UnknownDatabase { database: String },

    #[error("connection reset while closing")]
    CloseFailed,

    #[error("invalid address: {0}")]
    Address(#[from] FixtureError)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedHandle {
    pub port: u16,
    pub kind: HandleKind
}

/// Answers for whichever simulated server owns the address's port.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    cluster: SimulatedCluster,
    fail_migrations: bool,
    fail_close: bool
}

impl SimulatedDriver {
    pub fn new(cluster: &SimulatedCluster) -> Self {
        Self {
            cluster: cluster.clone(),
            fail_migrations: false,
            fail_close: false
        }
    }

    pub fn failing_migrations(mut self) -> Self {
        self.fail_migrations = true;
        self
    }

    /// `close` reports an error and leaves the handle counted as open.
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    fn check_server(&self, port: u16, require_ready: bool) -> Result<String, SimulatedError> {
        let id = self
            .cluster
            .server_id_for(port)
            .ok_or(SimulatedError::ConnectionRefused { port })?;
        let server = self
            .cluster
            .state
            .servers
            .get(&id)
            .ok_or(SimulatedError::ConnectionRefused { port })?;
        if server.status != ContainerStatus::Running {
            return Err(SimulatedError::ConnectionRefused { port });
        }
        if require_ready && !server.accepts_queries() {
            return Err(SimulatedError::Starting);
        }
        Ok(id)
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    type Handle = SimulatedHandle;
    type Error = SimulatedError;

    async fn open(&self, address: &str, kind: HandleKind) -> Result<SimulatedHandle, SimulatedError> {
        self.cluster.state.probes.fetch_add(1, Ordering::SeqCst);
        let params = ConnectionParams::parse(address)?;

        // Pools connect lazily; a single connection needs a live server.
        if !kind.is_pool() {
            let id = self.check_server(params.port, true)?;
            let server = self
                .cluster
                .state
                .servers
                .get(&id)
                .ok_or(SimulatedError::ConnectionRefused { port: params.port })?;
            if server.user != params.user || Some(&server.password) != params.password.as_ref() {
                return Err(SimulatedError::AuthenticationFailed { user: params.user });
            }
            if server.database != params.dbname {
                return Err(SimulatedError::UnknownDatabase {
                    database: params.dbname
                });
            }
        }

        self.cluster.state.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(SimulatedHandle {
            port: params.port,
            kind
        })
    }

    async fn ping(&self, handle: &mut SimulatedHandle) -> Result<(), SimulatedError> {
        self.cluster.state.probes.fetch_add(1, Ordering::SeqCst);
        self.check_server(handle.port, true).map(|_| ())
    }

    async fn close(&self, _handle: SimulatedHandle) -> Result<(), SimulatedError> {
        if self.fail_close {
            return Err(SimulatedError::CloseFailed);
        }
        self.cluster.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_migrations(
        &self,
        handle: &mut SimulatedHandle,
        source: &MigrationSource
    ) -> Result<MigrationOutcome, FixtureError> {
        let failed = |reason: String| FixtureError::Migration {
            source_path: source.to_string(),
            reason
        };

        if self.fail_migrations {
            return Err(failed("syntax error at or near \"CREAT\"".to_string()));
        }

        let mut entries = tokio::fs::read_dir(source.path())
            .await
            .map_err(|e| failed(e.to_string()))?;
        let mut scripts = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| failed(e.to_string()))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".sql") {
                scripts.insert(name);
            }
        }

        let id = self
            .check_server(handle.port, true)
            .map_err(|e| failed(e.to_string()))?;
        let mut server = self
            .cluster
            .state
            .servers
            .get_mut(&id)
            .ok_or_else(|| failed("server went away".to_string()))?;

        let mut count = 0;
        for script in scripts {
            if server.applied.insert(script) {
                count += 1;
            }
        }

        Ok(if count > 0 {
            MigrationOutcome::Applied { count }
        } else {
            MigrationOutcome::NoChange
        })
    }
}
