//! SQLite storage backend for rampart.
//!
//! Attempt records, the security event log, CSRF token hashes and two-factor
//! configurations live in one database, so several processes sharing the file
//! enforce the same limits.
//!
//! ```rust,ignore
//! use rampart_core::repositories::RepositoryProvider;
//! use rampart_storage_sqlite::SqliteRepositoryProvider;
//! use sqlx::SqlitePool;
//!
//! let pool = SqlitePool::connect("sqlite://rampart.db?mode=rwc").await?;
//! let provider = SqliteRepositoryProvider::new(pool);
//! provider.migrate().await?;
//! ```

pub mod migrations;
pub mod repositories;

pub use repositories::{
    SqliteAlertRepository, SqliteAttemptRepository, SqliteCsrfTokenRepository,
    SqliteRepositoryProvider, SqliteTwoFactorRepository,
};
