//! Local run store.
//!
//! SQLite connection pool, embedded migrations and the append-only
//! `run_records` repository.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub mod models;
pub mod repositories;
pub mod store;

pub type DbPool = sqlx::SqlitePool;

/// File name of the run database inside `paths.data_dir`.
pub const DATABASE_FILE: &str = "runs.db";

/// Create a connection pool from a database URL, e.g. `sqlite::memory:`.
///
/// In-memory databases live per connection, so they get exactly one
/// connection that is never recycled.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    connect(options, database_url.contains(":memory:")).await
}

/// Open (creating if needed) the run database under `data_dir` and apply
/// pending migrations.
pub async fn open(data_dir: &Path) -> Result<DbPool, sqlx::Error> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(DATABASE_FILE);
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = connect(options, false).await?;
    run_migrations(&pool).await?;
    tracing::info!(path = %path.display(), "Run database ready");
    Ok(pool)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 4 })
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}
