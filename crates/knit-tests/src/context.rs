//! Test context providing access to the test catalog.

use crate::containers::PostgresContainer;
use knit_db::{Database, DatabaseConfig, PgCatalog};
use knit_engine::Engine;
use tracing::debug;

/// Test context with a migrated PostgreSQL catalog.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl TestContext {
    /// Create context with only PostgreSQL, migrated.
    pub async fn postgres_only() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let config = DatabaseConfig::new(postgres.connection_string()).with_max_connections(8);
        let db = Database::connect_with(&config).await?;
        debug!(url = postgres.connection_string(), "Test catalog ready");

        Ok(Self { postgres, db })
    }

    /// Get database connection string.
    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    pub fn catalog(&self) -> PgCatalog {
        self.db.catalog()
    }

    /// An engine over this context's catalog.
    pub fn engine(&self) -> Engine<PgCatalog> {
        Engine::new(self.catalog())
    }
}
