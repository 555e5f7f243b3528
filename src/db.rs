//! SQLite pool setup and schema migration for the local backend.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;
use tracing::{debug, info};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Connect to `database_url`, creating the database file if needed.
///
/// In-memory databases are private to one connection, so the pool is
/// limited to a single connection for them.
pub async fn connect(database_url: &str) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    debug!(
        "connecting to {} with up to {} connections",
        database_url, max_connections
    );

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> sqlx::Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Fresh in-memory database with the schema applied, for unit tests.
#[cfg(test)]
pub async fn open_in_memory() -> sqlx::Result<SqlitePool> {
    let db = connect("sqlite::memory:").await?;
    run_migrations(&db).await?;
    Ok(db)
}
