//! Builder pattern for constructing Rampart instances
//!
//! This module provides a type-safe builder for creating [`Rampart`] instances with
//! compile-time validation of storage configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use rampart::RampartBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build with SQLite and auto-migration
//!     let rampart = RampartBuilder::new()
//!         .with_sqlite("sqlite::memory:")
//!         .await?
//!         .with_secret_key("<base64 key>")
//!         .apply_migrations(true)
//!         .build()
//!         .await?;
//!
//!     // Or build from the environment on the in-memory store
//!     let rampart = RampartBuilder::new()
//!         .with_memory()
//!         .with_config(rampart::RampartConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use rampart_core::{
    Clock, EventBus, EventHandler, RampartConfig, RepositoryProvider, SecurityRule, SystemClock,
    error::ConfigurationError, repositories::InMemoryRepositoryProvider,
};

use crate::Rampart;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when building a Rampart instance.
#[derive(Debug, thiserror::Error)]
pub enum RampartBuilderError {
    /// Failed to connect to storage backend
    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    /// Failed to run database migrations
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigurationError),
}

// ============================================================================
// Type-State Markers
// ============================================================================

/// Marker type indicating no storage has been configured yet.
///
/// This is the initial state of [`RampartBuilder`].
pub struct NoStorage;

/// Marker type indicating storage has been configured.
pub struct WithStorage<R: RepositoryProvider> {
    repositories: Arc<R>,
}

// ============================================================================
// Builder Implementation
// ============================================================================

/// A type-safe builder for constructing [`Rampart`] instances.
///
/// # Type States
///
/// - [`NoStorage`]: Initial state, storage must be configured
/// - [`WithStorage<R>`]: Storage configured, ready to build or add more configuration
pub struct RampartBuilder<Storage> {
    storage: Storage,
    config: RampartConfig,
    clock: Arc<dyn Clock>,
    handlers: Vec<Arc<dyn EventHandler>>,
    apply_migrations: bool,
}

impl Default for RampartBuilder<NoStorage> {
    fn default() -> Self {
        Self::new()
    }
}

impl RampartBuilder<NoStorage> {
    /// Create a new builder with default configuration.
    ///
    /// # Defaults
    ///
    /// - Rules: [`SecurityRule::defaults`]
    /// - Clock: the system clock
    /// - Apply migrations: false
    /// - Secret key: none; one must be supplied before `build()`
    pub fn new() -> Self {
        Self {
            storage: NoStorage,
            config: RampartConfig::default(),
            clock: Arc::new(SystemClock),
            handlers: Vec::new(),
            apply_migrations: false,
        }
    }

    /// Keep all state in process memory.
    ///
    /// Limits only hold within this process.
    pub fn with_memory(self) -> RampartBuilder<WithStorage<InMemoryRepositoryProvider>> {
        self.with_repositories(Arc::new(InMemoryRepositoryProvider::new()))
    }

    /// Use any repository provider, including a custom one.
    pub fn with_repositories<R: RepositoryProvider>(
        self,
        repositories: Arc<R>,
    ) -> RampartBuilder<WithStorage<R>> {
        RampartBuilder {
            storage: WithStorage { repositories },
            config: self.config,
            clock: self.clock,
            handlers: self.handlers,
            apply_migrations: self.apply_migrations,
        }
    }
}

// ============================================================================
// Storage Configuration Methods (NoStorage -> WithStorage)
// ============================================================================

#[cfg(feature = "sqlite")]
impl RampartBuilder<NoStorage> {
    /// Configure SQLite storage by connecting to the given URL.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL (e.g., "sqlite::memory:" or "sqlite://path/to/db.sqlite")
    pub async fn with_sqlite(
        self,
        url: &str,
    ) -> Result<
        RampartBuilder<WithStorage<crate::SqliteRepositoryProvider>>,
        RampartBuilderError,
    > {
        let pool = sqlx::SqlitePool::connect(url)
            .await
            .map_err(|e| RampartBuilderError::StorageConnection(e.to_string()))?;

        Ok(self.with_sqlite_pool(pool))
    }

    /// Configure SQLite storage with an existing connection pool.
    pub fn with_sqlite_pool(
        self,
        pool: sqlx::SqlitePool,
    ) -> RampartBuilder<WithStorage<crate::SqliteRepositoryProvider>> {
        self.with_repositories(Arc::new(crate::SqliteRepositoryProvider::new(pool)))
    }
}

// ============================================================================
// Configuration Methods (available after storage is configured)
// ============================================================================

impl<R: RepositoryProvider> RampartBuilder<WithStorage<R>> {
    /// Replace the whole configuration.
    ///
    /// A secret key set earlier with [`Self::with_secret_key`] is kept when
    /// `config` carries none.
    pub fn with_config(mut self, config: RampartConfig) -> Self {
        let secret_key = config.secret_key.clone().or(self.config.secret_key.take());
        self.config = config;
        self.config.secret_key = secret_key;
        self
    }

    /// Set the base64 encoded 32-byte key used to seal TOTP secrets.
    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.config.secret_key = Some(key.into());
        self
    }

    /// Add a rule or replace the rule with the same name.
    pub fn with_rule(mut self, rule: SecurityRule) -> Self {
        self.config = self.config.with_rule(rule);
        self
    }

    /// Set the TOTP issuer shown in authenticator apps.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config.totp.issuer = issuer.into();
        self
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a handler for security events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set whether to automatically apply database migrations during build.
    ///
    /// Default: false
    pub fn apply_migrations(mut self, apply: bool) -> Self {
        self.apply_migrations = apply;
        self
    }

    /// Build the Rampart instance.
    ///
    /// # Errors
    ///
    /// [`RampartBuilderError::InvalidConfiguration`] for any invalid setting,
    /// including a missing secret key, and
    /// [`RampartBuilderError::Migration`] if migrations were requested and
    /// failed.
    pub async fn build(self) -> Result<Rampart<R>, RampartBuilderError> {
        if self.apply_migrations {
            self.storage
                .repositories
                .migrate()
                .await
                .map_err(|e| RampartBuilderError::Migration(e.to_string()))?;
        }

        let events = EventBus::new();
        for handler in self.handlers {
            events.register(handler).await;
        }

        let rampart =
            Rampart::from_parts(self.storage.repositories, self.config, self.clock, events)?;

        tracing::info!(
            rules = rampart.rules().len(),
            issuer = %rampart.config().totp.issuer,
            "Rampart initialized"
        );
        Ok(rampart)
    }
}
