// Database service for ZipCase

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, instrument};

pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    #[instrument]
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        info!("Initializing database connection to: {}", database_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        debug!("Database health check passed");
        Ok(())
    }
}
