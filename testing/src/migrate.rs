//! File-based schema migrations, applied once per fixture.

use crate::driver::PgHandle;
use config::MigrationSource;
use errors::FixtureError;
use sqlx::PgConnection;
use sqlx::migrate::Migrator;

/// Result of a successful migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied { count: u64 },
    NoChange
}

impl MigrationOutcome {
    pub fn applied(&self) -> u64 {
        match self {
            MigrationOutcome::Applied { count } => *count,
            MigrationOutcome::NoChange => 0
        }
    }
}

/// Run every pending `<version>_<description>.sql` file in `source`.
pub(crate) async fn apply_pg_migrations(
    handle: &mut PgHandle,
    source: &MigrationSource
) -> Result<MigrationOutcome, FixtureError> {
    let migrator = Migrator::new(source.path())
        .await
        .map_err(|e| migration_error(source, e))?;

    match handle {
        PgHandle::Connection(conn) => run_migrator(&migrator, conn, source).await,
        PgHandle::Pool(pool) => {
            let mut conn = pool.acquire().await.map_err(|e| migration_error(source, e))?;
            run_migrator(&migrator, &mut conn, source).await
        }
    }
}

async fn run_migrator(
    migrator: &Migrator,
    conn: &mut PgConnection,
    source: &MigrationSource
) -> Result<MigrationOutcome, FixtureError> {
    let before = applied_count(conn)
        .await
        .map_err(|e| migration_error(source, e))?;

    migrator
        .run_direct(&mut *conn)
        .await
        .map_err(|e| migration_error(source, e))?;

    let after = applied_count(conn)
        .await
        .map_err(|e| migration_error(source, e))?;

    if after > before {
        Ok(MigrationOutcome::Applied {
            count: (after - before) as u64
        })
    } else {
        Ok(MigrationOutcome::NoChange)
    }
}

/// Successful rows in sqlx's bookkeeping table, 0 before it exists.
async fn applied_count(conn: &mut PgConnection) -> Result<i64, sqlx::Error> {
    let table: Option<String> = sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations')::text")
        .fetch_one(&mut *conn)
        .await?;
    if table.is_none() {
        return Ok(0);
    }

    sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
        .fetch_one(&mut *conn)
        .await
}

fn migration_error(source: &MigrationSource, err: impl std::fmt::Display) -> FixtureError {
    FixtureError::Migration {
        source_path: source.to_string(),
        reason: err.to_string()
    }
}
