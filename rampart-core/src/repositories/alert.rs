//! Repository trait for the security event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error,
    storage::{AlertFilter, SecurityAlert},
};

/// Append-only storage for security alerts.
///
/// Alerts are never deleted or rewritten. The single permitted mutation is
/// marking an alert resolved.
#[async_trait]
pub trait AlertRepository: Send + Sync + 'static {
    async fn append(&self, alert: SecurityAlert) -> Result<SecurityAlert, Error>;

    async fn find(&self, id: &str) -> Result<Option<SecurityAlert>, Error>;

    /// Alerts matching `filter`, newest first, capped at `filter.limit`.
    async fn list(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error>;

    /// Mark an alert resolved.
    ///
    /// # Returns
    ///
    /// `true` if this call resolved the alert, `false` if it is unknown or was
    /// already resolved.
    async fn resolve(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<bool, Error>;
}
