//! SQLite-based persistence layer
//!
//! This module provides:
//! - Database initialization and migrations
//! - File records and the append-only operation log
//! - Connection pooling
//! - The [`MetadataRecorder`] seam the engine reports mutations through

mod migrations;
mod queries;
mod recorder;

pub use migrations::run_migrations;
pub use queries::*;
pub use recorder::{record_mutation, MetadataRecorder, NullRecorder};

#[cfg(test)]
pub use recorder::MockMetadataRecorder;

use crate::config::StorageConfig;
use crate::error::{Error, Result, StorageError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use tracing::info;

/// Database connection pool type
pub type DbPool = Pool<SqliteConnectionManager>;

/// Storage manager for database operations
pub struct Storage {
    pool: DbPool,
    db_path: PathBuf,
}

impl Storage {
    /// Create a new storage instance with a directory path
    pub fn new_with_path(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::from_path(data_dir.as_ref().join("sandkeep.db"))
    }

    /// Open the database named in the configuration
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::from_path(config.database_path.clone())
    }

    /// Create storage from a specific database file
    pub fn from_path(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(StorageError::Database(format!(
                    "Failed to create data directory: {}",
                    e
                )))
            })?;
        }
        info!("Database path: {:?}", db_path);

        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self { pool, db_path };
        storage.initialize()?;

        Ok(storage)
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))?;

        let storage = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
        };

        storage.initialize()?;

        Ok(storage)
    }

    /// Initialize database with migrations
    fn initialize(&self) -> Result<()> {
        let conn = self.pool.get()?;
        run_migrations(&conn).map_err(|e| {
            Error::Storage(StorageError::MigrationFailed(e.to_string()))
        })?;
        info!("Database initialized successfully");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| Error::Storage(StorageError::Pool(e.to_string())))
    }

    /// Get the database path
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Get the connection pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
