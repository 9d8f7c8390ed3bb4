use std::time::Duration;

use cinch_core::config::DatabaseConfig;
use cinch_core::error::{CinchError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// The storage backend's connection pool, plus the handful of lifecycle
/// operations every caller needs (health check, graceful close).
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| CinchError::StorageTransient(format!("failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
