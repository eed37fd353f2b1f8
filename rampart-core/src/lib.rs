//! Core functionality for the rampart project
//!
//! This crate contains the authentication-security building blocks: attempt
//! tracking with blocking rules, TOTP two-factor authentication with backup
//! codes, CSRF tokens, input sanitization and the security event log.
//!
//! Services are generic over the repository traits in [`repositories`]. The
//! in-memory backend lives in [`repositories::memory`]; shared backends live
//! in their own crates.
//!
//! Most applications use the `rampart` crate, which wires these pieces
//! together, rather than this crate directly.
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod id;
pub mod repositories;
pub mod services;
pub mod storage;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CsrfConfig, RampartConfig, TotpConfig};
pub use error::Error;
pub use events::{Event, EventBus, EventHandler};
pub use repositories::RepositoryProvider;
pub use storage::{
    AlertFilter, AlertSeverity, AlertType, AttemptDecision, AttemptRecord, BackupCode, CsrfToken,
    RuleScope, SecurityAlert, SecurityRule, TwoFactorConfig, TwoFactorEnrollment,
};
pub use validation::{SanitizeOptions, ValidationResult};
