//! PostgreSQL connection pool shared by the worker and the admin tooling
//!
//! The pool is created once by the outermost process, handed to
//! [`PostgresStore`](crate::store::PostgresStore) and closed on shutdown.

use crate::config::DatabaseConfig;
use crate::error::CoreError;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

/// Shared database connection pool
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create new database pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, CoreError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(Some(config.idle_timeout))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Get reference to underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if pool is healthy
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Close every connection; called once on process shutdown
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}
