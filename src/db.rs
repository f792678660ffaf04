use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// The query engine runs on a smaller pool bound to the read-only role;
/// write statements are rejected by role privileges, not by code.
pub fn connect_lazy_read_only(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(6)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create read-only database pool for {database_url}"))
}
