//! Repository implementations for SQLite storage
//!
//! Timestamps are stored as Unix milliseconds so rolling windows keep the
//! precision the rules are configured with.

pub mod alert;
pub mod attempt;
pub mod csrf;
pub mod two_factor;

pub use alert::SqliteAlertRepository;
pub use attempt::SqliteAttemptRepository;
pub use csrf::SqliteCsrfTokenRepository;
pub use two_factor::SqliteTwoFactorRepository;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{
    Error,
    error::StorageError,
    repositories::{
        AlertRepositoryProvider, AttemptRepositoryProvider, CsrfTokenRepositoryProvider,
        RepositoryProvider, TwoFactorRepositoryProvider,
    },
};
use sqlx::SqlitePool;

use crate::migrations::{self, SqliteMigrationManager};

/// Log a driver error and hide its detail behind a fixed message.
pub(crate) fn database_error(message: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        tracing::error!(error = %e, "{}", message);
        Error::Storage(StorageError::Database(message.to_string()))
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        Error::Storage(StorageError::Serialization(format!(
            "timestamp out of range: {ms}"
        )))
    })
}

/// Repository provider implementation for SQLite
///
/// This struct implements all the individual repository provider traits
/// as well as the unified `RepositoryProvider` trait.
pub struct SqliteRepositoryProvider {
    pool: SqlitePool,
    attempts: Arc<SqliteAttemptRepository>,
    alerts: Arc<SqliteAlertRepository>,
    csrf_tokens: Arc<SqliteCsrfTokenRepository>,
    two_factor: Arc<SqliteTwoFactorRepository>,
}

impl SqliteRepositoryProvider {
    pub fn new(pool: SqlitePool) -> Self {
        let attempts = Arc::new(SqliteAttemptRepository::new(pool.clone()));
        let alerts = Arc::new(SqliteAlertRepository::new(pool.clone()));
        let csrf_tokens = Arc::new(SqliteCsrfTokenRepository::new(pool.clone()));
        let two_factor = Arc::new(SqliteTwoFactorRepository::new(pool.clone()));

        Self {
            pool,
            attempts,
            alerts,
            csrf_tokens,
            two_factor,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl AttemptRepositoryProvider for SqliteRepositoryProvider {
    type AttemptRepo = SqliteAttemptRepository;

    fn attempts(&self) -> &Self::AttemptRepo {
        &self.attempts
    }
}

impl AlertRepositoryProvider for SqliteRepositoryProvider {
    type AlertRepo = SqliteAlertRepository;

    fn alerts(&self) -> &Self::AlertRepo {
        &self.alerts
    }
}

impl CsrfTokenRepositoryProvider for SqliteRepositoryProvider {
    type CsrfTokenRepo = SqliteCsrfTokenRepository;

    fn csrf_tokens(&self) -> &Self::CsrfTokenRepo {
        &self.csrf_tokens
    }
}

impl TwoFactorRepositoryProvider for SqliteRepositoryProvider {
    type TwoFactorRepo = SqliteTwoFactorRepository;

    fn two_factor(&self) -> &Self::TwoFactorRepo {
        &self.two_factor
    }
}

#[async_trait]
impl RepositoryProvider for SqliteRepositoryProvider {
    async fn migrate(&self) -> Result<(), Error> {
        let manager = SqliteMigrationManager::new(self.pool.clone());
        manager.initialize().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize migrations");
            Error::Storage(StorageError::Migration(
                "Failed to initialize migrations".to_string(),
            ))
        })?;

        manager.up(&migrations::all()).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            Error::Storage(StorageError::Migration(
                "Failed to run migrations".to_string(),
            ))
        })?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(StorageError::Connection(e.to_string())))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{path::Path, time::Duration};

    use sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    };

    use super::SqliteRepositoryProvider;
    use rampart_core::repositories::RepositoryProvider;

    pub async fn pool() -> SqlitePool {
        let _ = tracing_subscriber::fmt().try_init();
        // One connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteRepositoryProvider::new(pool.clone())
            .migrate()
            .await
            .unwrap();
        pool
    }

    /// A migrated database file that several connections write to at once.
    pub async fn file_pool(path: &Path, connections: u32) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(connections)
            .connect_with(options)
            .await
            .unwrap();
        SqliteRepositoryProvider::new(pool.clone())
            .migrate()
            .await
            .unwrap();
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_and_health_check() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let provider = SqliteRepositoryProvider::new(pool);
        provider.migrate().await.unwrap();
        provider.migrate().await.unwrap();
        provider.health_check().await.unwrap();
    }

    #[test]
    fn test_millis_round_trip_keeps_precision() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)).unwrap(), at);
    }
}
