//! Document store layer for mailpipe.
//!
//! Exposes the [`DocumentStore`] capability the reliability core consumes,
//! with a `PostgreSQL` implementation ([`TrackedDocumentRepository`]) and a
//! process-local one ([`MemoryDocumentStore`]).

pub mod entities;
pub mod memory;
pub mod migrations;
pub mod repositories;
pub mod store;
#[cfg(feature = "test-utils")]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use mailpipe_common::{AppError, Config, DatabaseConfig, StoreBackend};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tracing::info;
use tracing::log::LevelFilter;

pub use memory::MemoryDocumentStore;
pub use repositories::TrackedDocumentRepository;
pub use store::{DocumentStore, ScanCursor};

/// Initialize database connection.
pub async fn init(config: &DatabaseConfig) -> Result<DatabaseConnection, AppError> {
    let mut opt = ConnectOptions::new(&config.url);

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(config.operation_timeout())
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(LevelFilter::Debug);

    Database::connect(opt)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}

/// Run pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), AppError> {
    use sea_orm_migration::MigratorTrait;
    migrations::Migrator::up(db, None)
        .await
        .map_err(|e| AppError::Database(e.to_string()))
}

/// Build the document store selected by configuration.
pub async fn connect_store(config: &Config) -> Result<Arc<dyn DocumentStore>, AppError> {
    match config.database.backend {
        StoreBackend::Postgres => {
            let db = init(&config.database).await?;
            info!("Connected to document store");
            Ok(Arc::new(TrackedDocumentRepository::new(
                Arc::new(db),
                config.database.operation_timeout(),
            )))
        }
        StoreBackend::Memory => {
            info!("Using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}
