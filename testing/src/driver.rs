//! Database driver boundary and its PostgreSQL implementation.

use crate::address::ConnectionParams;
use crate::migrate::{self, MigrationOutcome};
use async_trait::async_trait;
use config::{HandleKind, MigrationSource, SslMode};
use errors::FixtureError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgConnection, PgPool};
use std::fmt;
use std::time::Duration;

/// Bounds a single pool probe; a lazy pool otherwise keeps retrying its
/// connect internally for sqlx's default 30s.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens, probes and closes database handles.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Handle: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a handle. May succeed before the server accepts queries (a lazy
    /// pool always does).
    async fn open(&self, address: &str, kind: HandleKind) -> Result<Self::Handle, Self::Error>;

    /// Lightweight liveness probe.
    async fn ping(&self, handle: &mut Self::Handle) -> Result<(), Self::Error>;

    async fn close(&self, handle: Self::Handle) -> Result<(), Self::Error>;

    /// Apply pending migrations once. Nothing pending is `NoChange`, not an
    /// error.
    async fn apply_migrations(
        &self,
        handle: &mut Self::Handle,
        source: &MigrationSource
    ) -> Result<MigrationOutcome, FixtureError>;
}

/// A live PostgreSQL handle: one connection or a bounded pool.
pub enum PgHandle {
    Connection(PgConnection),
    Pool(PgPool)
}

impl fmt::Debug for PgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgHandle::Connection(_) => f.write_str("PgHandle::Connection"),
            PgHandle::Pool(pool) => f
                .debug_struct("PgHandle::Pool")
                .field("size", &pool.size())
                .finish()
        }
    }
}

impl PgHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            PgHandle::Connection(_) => HandleKind::Single,
            PgHandle::Pool(pool) => HandleKind::pool(pool.options().get_max_connections())
        }
    }

    pub fn as_pool(&self) -> Option<&PgPool> {
        match self {
            PgHandle::Pool(pool) => Some(pool),
            PgHandle::Connection(_) => None
        }
    }

    pub fn as_connection(&mut self) -> Option<&mut PgConnection> {
        match self {
            PgHandle::Connection(conn) => Some(conn),
            PgHandle::Pool(_) => None
        }
    }

    pub async fn ping(&mut self) -> Result<(), sqlx::Error> {
        match self {
            PgHandle::Connection(conn) => conn.ping().await,
            PgHandle::Pool(pool) => pool.acquire().await?.ping().await
        }
    }

    /// Execute a statement that returns no rows.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = match self {
            PgHandle::Connection(conn) => sqlx::query(sql).execute(&mut *conn).await?,
            PgHandle::Pool(pool) => sqlx::query(sql).execute(&*pool).await?
        };
        Ok(result.rows_affected())
    }

    /// Run a query returning a single `BIGINT`.
    pub async fn fetch_i64(&mut self, sql: &str) -> Result<i64, sqlx::Error> {
        match self {
            PgHandle::Connection(conn) => sqlx::query_scalar(sql).fetch_one(&mut *conn).await,
            PgHandle::Pool(pool) => sqlx::query_scalar(sql).fetch_one(&*pool).await
        }
    }
}

/// sqlx-backed PostgreSQL driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn connect_options(address: &str) -> Result<PgConnectOptions, FixtureError> {
        let params = ConnectionParams::parse(address)?;

        let mut options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.user)
            .database(&params.dbname)
            .ssl_mode(pg_ssl_mode(params.sslmode));
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    type Handle = PgHandle;
    type Error = sqlx::Error;

    async fn open(&self, address: &str, kind: HandleKind) -> Result<PgHandle, sqlx::Error> {
        let options =
            Self::connect_options(address).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;

        match kind {
            HandleKind::Single => Ok(PgHandle::Connection(
                PgConnection::connect_with(&options).await?
            )),
            HandleKind::Pool { max_connections } => Ok(PgHandle::Pool(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
                    .connect_lazy_with(options)
            ))
        }
    }

    async fn ping(&self, handle: &mut PgHandle) -> Result<(), sqlx::Error> {
        handle.ping().await
    }

    async fn close(&self, handle: PgHandle) -> Result<(), sqlx::Error> {
        match handle {
            PgHandle::Connection(conn) => conn.close().await,
            PgHandle::Pool(pool) => {
                pool.close().await;
                Ok(())
            }
        }
    }

    async fn apply_migrations(
        &self,
        handle: &mut PgHandle,
        source: &MigrationSource
    ) -> Result<MigrationOutcome, FixtureError> {
        migrate::apply_pg_migrations(handle, source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{AddressFormat, FixtureConfig};

    #[test]
    fn test_connect_options_from_key_value() {
        let config = FixtureConfig::builder()
            .with_user("app")
            .with_database_name("orders")
            .build()
            .unwrap();
        let address = crate::address::build_address(&config, "localhost", 40100).unwrap();
        let options = PostgresDriver::connect_options(&address).unwrap();

        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 40100);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("orders"));
    }

    #[test]
    fn test_connect_options_from_uri() {
        let config = FixtureConfig::builder()
            .with_address_format(AddressFormat::Uri)
            .build()
            .unwrap();
        let address = crate::address::build_address(&config, "127.0.0.1", 40101).unwrap();
        let options = PostgresDriver::connect_options(&address).unwrap();

        assert_eq!(options.get_host(), "127.0.0.1");
        assert_eq!(options.get_port(), 40101);
    }

    #[test]
    fn test_connect_options_reject_garbage() {
        let err = PostgresDriver::connect_options("not an address").unwrap_err();
        assert_eq!(err.stage(), errors::SetupStage::Address);
    }

    #[tokio::test]
    async fn test_pool_open_is_lazy() {
        let config = FixtureConfig::builder().with_pool(2).build().unwrap();
        // Nothing listens on port 1; a lazy pool still opens.
        let address = crate::address::build_address(&config, "127.0.0.1", 1).unwrap();
        let handle = PostgresDriver
            .open(&address, config.handle_kind())
            .await
            .unwrap();
        assert_eq!(handle.kind(), HandleKind::pool(2));
        PostgresDriver.close(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_open_fails_without_server() {
        let address = crate::address::build_address(&FixtureConfig::default(), "127.0.0.1", 1)
            .unwrap();
        assert!(PostgresDriver.open(&address, HandleKind::Single).await.is_err());
    }
}
