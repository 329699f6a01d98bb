//! Database connection pools

use std::time::Duration;

use ctxstore_shared::config::PoolSettings;

#[cfg(feature = "sql")]
use sqlx::{any::AnyPoolOptions, AnyPool};
#[cfg(feature = "distributed")]
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Pool over whichever driver the URL scheme names (sqlite, postgres, mysql).
#[cfg(feature = "sql")]
pub async fn create_any_pool(url: &str, settings: &PoolSettings) -> Result<AnyPool, sqlx::Error> {
    sqlx::any::install_default_drivers();
    // Every connection to an in-memory SQLite database is a separate database.
    let max_connections = if url.contains(":memory:") {
        1
    } else {
        settings.max_connections
    };
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_seconds))
        .connect(url)
        .await
}

#[cfg(feature = "distributed")]
pub async fn create_pg_pool(url: &str, settings: &PoolSettings) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_seconds))
        .connect(url)
        .await
}
