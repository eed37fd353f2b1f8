//! Repository traits for the data access layer
//!
//! Services talk to storage only through these traits, so the same tracker,
//! two-factor and CSRF logic runs against the in-process store and against a
//! shared database.
//!
//! # Trait Hierarchy
//!
//! - Individual `*Repository` traits define the operations for each data domain
//! - Individual `*RepositoryProvider` traits provide access to each repository type
//! - [`RepositoryProvider`] is a supertrait combining all provider traits plus lifecycle methods

pub mod adapter;
pub mod alert;
pub mod attempt;
pub mod csrf;
pub mod memory;
pub mod two_factor;

pub use adapter::{
    AlertRepositoryAdapter, AttemptRepositoryAdapter, CsrfTokenRepositoryAdapter,
    TwoFactorRepositoryAdapter,
};
pub use alert::AlertRepository;
pub use attempt::AttemptRepository;
pub use csrf::CsrfTokenRepository;
pub use memory::InMemoryRepositoryProvider;
pub use two_factor::TwoFactorRepository;

use async_trait::async_trait;

use crate::Error;

// ============================================================================
// Individual Repository Provider Traits
// ============================================================================

/// Provider trait for attempt record access.
pub trait AttemptRepositoryProvider: Send + Sync + 'static {
    /// The attempt repository implementation type
    type AttemptRepo: AttemptRepository;

    /// Get the attempt repository
    fn attempts(&self) -> &Self::AttemptRepo;
}

/// Provider trait for security event log access.
pub trait AlertRepositoryProvider: Send + Sync + 'static {
    /// The alert repository implementation type
    type AlertRepo: AlertRepository;

    /// Get the alert repository
    fn alerts(&self) -> &Self::AlertRepo;
}

/// Provider trait for CSRF token storage access.
pub trait CsrfTokenRepositoryProvider: Send + Sync + 'static {
    /// The CSRF token repository implementation type
    type CsrfTokenRepo: CsrfTokenRepository;

    /// Get the CSRF token repository
    fn csrf_tokens(&self) -> &Self::CsrfTokenRepo;
}

/// Provider trait for two-factor configuration access.
pub trait TwoFactorRepositoryProvider: Send + Sync + 'static {
    /// The two-factor repository implementation type
    type TwoFactorRepo: TwoFactorRepository;

    /// Get the two-factor repository
    fn two_factor(&self) -> &Self::TwoFactorRepo;
}

// ============================================================================
// Unified Repository Provider Trait
// ============================================================================

/// Provider trait that storage implementations must implement to provide all repositories.
///
/// # Implementing a Custom Storage Backend
///
/// 1. Implement each individual `*Repository` trait for your backend
/// 2. Implement each individual `*RepositoryProvider` trait
/// 3. Implement the `RepositoryProvider` trait with `migrate()` and `health_check()`
///
/// ```rust,ignore
/// use rampart_core::repositories::*;
///
/// struct RedisStorage { /* ... */ }
///
/// impl AttemptRepositoryProvider for RedisStorage {
///     type AttemptRepo = RedisAttemptRepository;
///     fn attempts(&self) -> &Self::AttemptRepo { &self.attempts }
/// }
///
/// // ... implement other provider traits ...
///
/// #[async_trait]
/// impl RepositoryProvider for RedisStorage {
///     async fn migrate(&self) -> Result<(), Error> { /* ... */ }
///     async fn health_check(&self) -> Result<(), Error> { /* ... */ }
/// }
/// ```
#[async_trait]
pub trait RepositoryProvider:
    AttemptRepositoryProvider
    + AlertRepositoryProvider
    + CsrfTokenRepositoryProvider
    + TwoFactorRepositoryProvider
{
    /// Run migrations for all repositories
    async fn migrate(&self) -> Result<(), Error>;

    /// Health check for all repositories
    async fn health_check(&self) -> Result<(), Error>;
}
