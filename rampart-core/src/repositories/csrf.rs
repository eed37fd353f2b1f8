//! Repository trait for CSRF token hashes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Error, storage::CsrfTokenRecord};

/// Storage for CSRF token records. Token values are never stored, only their
/// hashes.
#[async_trait]
pub trait CsrfTokenRepository: Send + Sync + 'static {
    /// Store a token record and trim the session to `max_live` live tokens,
    /// evicting the oldest first. Expired records of the session are dropped
    /// in the same step.
    async fn store(
        &self,
        record: CsrfTokenRecord,
        max_live: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Every record of the session, expired ones included.
    async fn find_by_session(&self, session_id: &str) -> Result<Vec<CsrfTokenRecord>, Error>;

    /// # Returns
    ///
    /// The number of records deleted.
    async fn delete_session(&self, session_id: &str) -> Result<u64, Error>;

    /// # Returns
    ///
    /// The number of records deleted.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}
