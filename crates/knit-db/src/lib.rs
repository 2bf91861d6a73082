//! Catalog store adapters for the knit metadata engine.
//!
//! [`PgCatalog`] keeps the catalog in PostgreSQL; [`MemoryCatalog`] keeps it
//! in process, for tests and embedding.

pub mod config;
pub mod memory;
pub mod repositories;

pub use self::config::DatabaseConfig;
pub use memory::{MemoryCatalog, MemoryTx};
pub use repositories::*;

use knit_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database with default pool settings.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(&DatabaseConfig::new(database_url).with_migrate(false)).await
    }

    /// Connect using `config`, applying migrations if it asks for them.
    pub async fn connect_with(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(Error::database)?;

        let db = Self { pool };
        if config.migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(Error::database)?;
        info!("Catalog migrations applied");
        Ok(())
    }

    /// A catalog backed by this pool.
    pub fn catalog(&self) -> PgCatalog {
        PgCatalog::new(self.pool.clone())
    }
}
