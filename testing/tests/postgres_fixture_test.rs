//! Integration tests against a real PostgreSQL container.
//!
//! These tests need Docker and are skipped when setup cannot start a
//! container.

use canned_containers::{ContainerFixture, Driver, MigrationOutcome, PostgresContext, PostgresDriver};
use config::{AddressFormat, FixtureConfig, MigrationSource};
use std::time::Duration;

async fn setup_or_skip(config: FixtureConfig) -> Option<PostgresContext> {
    canned_containers::init_test_tracing();
    match ContainerFixture::postgres(config).setup().await {
        Ok(ctx) => Some(ctx),
        Err(e) if e.stage() == errors::SetupStage::Start => {
            eprintln!("Skipping PostgreSQL test: Docker not available ({e})");
            None
        }
        Err(e) => panic!("fixture setup failed: {e}")
    }
}

fn config() -> config::FixtureConfigBuilder {
    FixtureConfig::builder().with_timeout(Duration::from_secs(60))
}

#[tokio::test]
async fn test_setup_returns_live_connection() {
    let Some(mut ctx) = setup_or_skip(config().build().unwrap()).await else {
        return;
    };

    ctx.ping().await.unwrap();
    assert_eq!(ctx.fetch_i64("SELECT 1::BIGINT").await.unwrap(), 1);

    ctx.teardown().await;
}

#[tokio::test]
async fn test_custom_credentials_and_uri_address() {
    let config = config()
        .with_user("app")
        .with_password("s3cret")
        .with_database_name("orders")
        .with_address_format(AddressFormat::Uri)
        .build()
        .unwrap();
    let Some(mut ctx) = setup_or_skip(config).await else {
        return;
    };

    assert!(ctx.address().starts_with("postgres://app:s3cret@"));
    let db: String = {
        let conn = ctx.as_connection().unwrap();
        sqlx::query_scalar("SELECT current_database()")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    };
    assert_eq!(db, "orders");

    ctx.teardown().await;
}

#[tokio::test]
async fn test_pool_handle() {
    let Some(ctx) = setup_or_skip(config().with_pool(4).build().unwrap()).await else {
        return;
    };

    let pool = ctx.as_pool().unwrap();
    assert_eq!(pool.options().get_max_connections(), 4);
    let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await.unwrap();
    assert_eq!(one, 1);

    ctx.teardown().await;
}

#[tokio::test]
async fn test_migrations_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("0001_create_accounts.sql"),
        "CREATE TABLE accounts (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL);"
    )
    .unwrap();
    std::fs::write(
        dir.path().join("0002_seed_accounts.sql"),
        "INSERT INTO accounts (name) VALUES ('alice'), ('bob');"
    )
    .unwrap();

    let config = config().with_migration_source(dir.path()).build().unwrap();
    let Some(mut ctx) = setup_or_skip(config).await else {
        return;
    };

    assert_eq!(
        ctx.migration_outcome(),
        Some(MigrationOutcome::Applied { count: 2 })
    );
    assert_eq!(
        ctx.fetch_i64("SELECT COUNT(*) FROM accounts").await.unwrap(),
        2
    );

    let again = PostgresDriver
        .apply_migrations(ctx.handle_mut(), &MigrationSource::from(dir.path()))
        .await
        .unwrap();
    assert_eq!(again, MigrationOutcome::NoChange);

    ctx.teardown().await;
}

#[tokio::test]
async fn test_broken_migration_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("0001_broken.sql"), "CREAT TABLE nope ();").unwrap();

    let config = config().with_migration_source(dir.path()).build().unwrap();
    match ContainerFixture::postgres(config).setup().await {
        Ok(_) => panic!("broken migration must fail setup"),
        Err(e) if e.stage() == errors::SetupStage::Start => {
            eprintln!("Skipping PostgreSQL test: Docker not available ({e})");
        }
        Err(e) => assert_eq!(e.stage(), errors::SetupStage::Migrate, "{e}")
    }
}
