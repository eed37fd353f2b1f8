//! Repository trait for persisted two-factor configurations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Error, storage::StoredTwoFactor};

/// Storage for sealed TOTP secrets and backup code digests.
///
/// An account has at most one active configuration and at most one pending
/// enrollment. A pending enrollment never affects the active configuration
/// until [`TwoFactorRepository::activate`] promotes it.
///
/// `activate`, `consume_step` and `redeem_backup_code` are compare-and-set
/// operations. Two concurrent requests presenting the same code must see
/// exactly one `true`.
#[async_trait]
pub trait TwoFactorRepository: Send + Sync + 'static {
    /// Insert or replace the pending enrollment of `config.account_id`.
    async fn save_pending(&self, config: StoredTwoFactor) -> Result<StoredTwoFactor, Error>;

    /// The active configuration.
    async fn find(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error>;

    async fn find_pending(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error>;

    /// Promote the pending enrollment sealed as `sealed_secret` to the active
    /// configuration, replacing the previous one, with `step` recorded as
    /// used.
    ///
    /// # Returns
    ///
    /// `false` if the pending enrollment is gone or was replaced by one with
    /// another secret.
    async fn activate(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, Error>;

    /// Record `step` as used if the active configuration is still sealed as
    /// `sealed_secret` and `step` is later than the last used step.
    ///
    /// # Returns
    ///
    /// `false` if the step (or a later one) was already used, which means the
    /// code is a replay, or if the configuration was replaced meanwhile.
    async fn consume_step(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
    ) -> Result<bool, Error>;

    /// Mark the unused backup code with `digest` as used.
    ///
    /// # Returns
    ///
    /// `false` if no unused code has that digest.
    async fn redeem_backup_code(
        &self,
        account_id: &str,
        digest: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, Error>;

    /// Remove the active configuration and any pending enrollment.
    ///
    /// # Returns
    ///
    /// `true` if either existed.
    async fn delete(&self, account_id: &str) -> Result<bool, Error>;
}
