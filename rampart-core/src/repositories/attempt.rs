//! Repository trait for attempt tracking.
//!
//! Every method is one atomic section per `(rule, identity)`: the backend loads
//! the [`AttemptRecord`], applies the matching transition and writes it back
//! before any other caller can observe the record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error,
    storage::{AttemptDecision, AttemptRecord, FailureOutcome, SecurityRule},
};

/// Storage for per-identity attempt records.
///
/// Identity keys arrive already normalized for the rule's scope. Records are
/// namespaced by rule name, so the same key under two rules is two records.
///
/// # Security Considerations
///
/// - `reserve` is the only way an attempt is admitted. Checking and reserving
///   in separate steps would let concurrent requests exceed the limit.
/// - Errors must be propagated. A backend that cannot reach its store must
///   not report an attempt as allowed.
#[async_trait]
pub trait AttemptRepository: Send + Sync + 'static {
    /// Check the rule for `key` and, if the attempt is allowed, hold a slot.
    ///
    /// A missing record behaves like an empty one and is created on admission.
    async fn reserve(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptDecision, Error>;

    /// Count a failure, converting a held slot if there is one.
    async fn record_failure(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, Error>;

    /// Give back one held slot without counting a failure. A missing record is
    /// not an error.
    async fn release(&self, rule: &SecurityRule, key: &str, now: DateTime<Utc>)
    -> Result<(), Error>;

    /// Block `key` until `until` regardless of its failure count.
    async fn block(
        &self,
        rule: &SecurityRule,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord, Error>;

    /// Delete the record.
    ///
    /// # Returns
    ///
    /// The record that was removed, if any.
    async fn clear(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error>;

    async fn find(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error>;

    /// Delete every record whose `expires_at` has passed and which is not
    /// blocked.
    ///
    /// # Returns
    ///
    /// The number of records deleted.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}
