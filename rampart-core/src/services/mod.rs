//! Service layer
//!
//! Each service owns one security concern and talks to storage only through
//! the repository traits.

pub mod csrf;
pub mod totp;
pub mod tracker;
pub mod two_factor;

pub use csrf::CsrfService;
pub use totp::TotpEngine;
pub use tracker::SecurityTracker;
pub use two_factor::TwoFactorService;
