use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;

pub type DbPool = PgPool;

/// Creates the shared, bounded connection pool. Acquisition waits up to the
/// configured timeout instead of failing immediately when the pool is busy.
pub async fn create_pool(config: &Config) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_seconds))
        .connect(&config.database_url)
        .await?;
    tracing::info!(
        max_connections = config.database_max_connections,
        "Database connection pool created"
    );
    Ok(pool)
}
