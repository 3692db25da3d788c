//! The persistence layer (C6): embedded SQLite behind a `DatabaseConnection`.
//!
//! Follows the functional core / imperative shell split: `DatabaseConfig`
//! is pure validation and connect-string assembly; `DatabaseConnection`
//! does the actual I/O (directory creation, pool setup, pragma
//! application, migration). Schema is embedded at compile time via
//! `sqlx::migrate!()`, one file per table family under `migrations/`.
//!
//! All writes are fire-and-forget from the dispatcher's perspective:
//! persistence failure logs a warning but never blocks serving (see
//! `rail_core.rs`). `log_message` returns the assigned `seq` so the
//! in-memory counter stays consistent even when persistence later fails.

pub mod repository;

use crate::error::StorageError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite, migrate::Migrator};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Configuration for the embedded database: where the file lives, and how
/// many connections to keep in the pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    data_dir: PathBuf,
    pool_size: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), pool_size: 5, enable_wal_mode: true }
    }

    /// A config suited to tests: a single connection, no WAL (tests often
    /// use temp directories torn down between cases, where WAL's extra
    /// files add no value).
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), pool_size: 1, enable_wal_mode: false }
    }

    #[must_use]
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join("resonance-rail.db")
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.pool_size == 0 {
            return Err(StorageError::DataDir("pool_size must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// A managed connection pool to the embedded database.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    fn connect_options(config: &DatabaseConfig) -> SqliteConnectOptions {
        let mut options = SqliteConnectOptions::new().filename(config.db_path()).create_if_missing(true);
        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }
        options = options.pragma("foreign_keys", "ON");
        options.disable_statement_logging()
    }

    /// Opens (creating if needed) the database at `config`'s data
    /// directory, applies pragmas, and runs embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the data directory cannot be created,
    /// the connection pool cannot be established, or migrations fail.
    pub async fn initialize(config: DatabaseConfig) -> Result<Self, StorageError> {
        config.validate()?;
        Self::ensure_data_dir(&config.data_dir).await?;

        let options = Self::connect_options(&config);
        let pool = SqlitePoolOptions::new().max_connections(config.pool_size).connect_with(options).await?;

        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA cache_size = -65536").execute(&pool).await?;

        info!("running database migrations");
        match MIGRATOR.run(&pool).await {
            Ok(()) => info!("database migrations complete"),
            Err(e) => {
                warn!(error = %e, "database migration failed");
                return Err(StorageError::Migration(e));
            }
        }

        Ok(Self { pool })
    }

    async fn ensure_data_dir(dir: &Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::DataDir(format!("failed to create {}: {e}", dir.display())))
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn initializes_and_runs_migrations() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::for_testing(dir.path());
        let conn = DatabaseConnection::initialize(config).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(conn.pool())
            .await
            .unwrap();
        assert!(count >= 7);
    }

    #[tokio::test]
    async fn rejects_zero_pool_size() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::for_testing(dir.path()).with_pool_size(0);
        let result = DatabaseConnection::initialize(config).await;
        assert!(result.is_err());
    }
}
