use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod capabilities;
pub mod commands;
pub mod dlq;
pub mod inbox;
pub mod outbox;
pub mod process;

pub use capabilities::Capabilities;

pub const ENV_DB_URL: &str = "PLATFORM_DATABASE_URL";

/// Connect to Postgres using `PLATFORM_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Connect to Postgres at an already-resolved DSN. Used by callers (the
/// daemon, the CLI) that resolve the DSN themselves via
/// `platform_config::secrets` rather than reading `PLATFORM_DATABASE_URL`
/// directly.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connect using `PLATFORM_DATABASE_URL` and ensure migrations are applied.
/// Used by integration tests across the workspace; only meaningful when a
/// real Postgres instance is reachable at that URL.
#[cfg(feature = "testkit")]
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Truncate every table this crate owns. Only ever called between test
/// cases, behind the `testkit` feature — never reachable in a production
/// build (mirrors the guard on [`testkit_db_pool`]).
#[cfg(feature = "testkit")]
pub async fn testkit_reset(pool: &PgPool) -> Result<()> {
    sqlx::query("truncate table process_log, process_instance, dlq, inbox, outbox, command")
        .execute(pool)
        .await
        .context("testkit_reset failed")?;
    Ok(())
}

/// Run `f` inside a single transaction, committing on `Ok` and rolling back
/// on `Err`. Used by callers that need to co-commit a command/outbox pair or
/// similar cross-module write (spec §4.1).
pub async fn with_tx<F, Fut, T>(pool: &PgPool, f: F) -> Result<T>
where
    F: FnOnce(&mut sqlx::Transaction<'_, sqlx::Postgres>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut tx = pool.begin().await.context("with_tx: begin")?;
    let result = f(&mut tx).await?;
    tx.commit().await.context("with_tx: commit")?;
    Ok(result)
}

/// Connectivity + schema-presence check surfaced by the CLI `status`
/// subcommand and the daemon's `/health` endpoint.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (has_command_table,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'command'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_command_table,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_command_table: bool,
}
