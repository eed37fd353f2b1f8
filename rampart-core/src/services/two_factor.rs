//! Persisted two-factor lifecycle.
//!
//! Secrets are sealed before they reach the repository and backup codes are
//! stored only as keyed digests. A TOTP code is accepted at most once: the
//! repository records the last consumed time step and refuses anything not
//! later than it.
//!
//! New secrets start as a pending enrollment next to the active
//! configuration, which stays in force until the first code from the new
//! secret promotes the pending one in its place.

use std::sync::Arc;

use crate::{
    Error,
    clock::Clock,
    crypto::SecretSealer,
    error::{CryptoError, TwoFactorError},
    events::{Event, EventBus},
    repositories::TwoFactorRepository,
    services::totp::{BACKUP_CODE_LENGTH, TotpEngine, normalize_backup_code},
    storage::{StoredBackupCode, StoredTwoFactor, TwoFactorEnrollment},
};

pub struct TwoFactorService<T: TwoFactorRepository> {
    repository: Arc<T>,
    engine: Arc<TotpEngine>,
    sealer: Arc<SecretSealer>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<T: TwoFactorRepository> TwoFactorService<T> {
    pub fn new(
        repository: Arc<T>,
        engine: Arc<TotpEngine>,
        sealer: Arc<SecretSealer>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            repository,
            engine,
            sealer,
            clock,
            events,
        }
    }

    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    /// Start enrollment for an account.
    ///
    /// The returned enrollment is the only time the secret and backup codes
    /// exist in plaintext. Two-factor stays inactive until [`Self::confirm`]
    /// succeeds. An unconfirmed enrollment is replaced.
    ///
    /// # Errors
    ///
    /// [`TwoFactorError::AlreadyEnrolled`] if the account has an active
    /// configuration; use [`Self::regenerate`] to replace it.
    pub async fn enroll(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        if self.repository.find(account_id.trim()).await?.is_some() {
            return Err(TwoFactorError::AlreadyEnrolled.into());
        }
        self.store_pending(account_id, display_name).await
    }

    /// Issue a new secret and backup codes for an account with active
    /// two-factor.
    ///
    /// The current secret and backup codes keep working until the new
    /// configuration is confirmed with [`Self::confirm`]; from then on only
    /// the new ones do.
    pub async fn regenerate(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        if self.repository.find(account_id.trim()).await?.is_none() {
            return Err(TwoFactorError::NotEnrolled.into());
        }
        self.store_pending(account_id, display_name).await
    }

    async fn store_pending(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        let enrollment = self
            .engine
            .generate_two_factor_config(account_id, display_name)?;
        let config = &enrollment.config;

        let sealed_secret = self
            .sealer
            .seal(config.secret.as_bytes(), &secret_aad(&config.account_id))?;
        let backup_codes = config
            .backup_codes
            .iter()
            .map(|code| StoredBackupCode {
                digest: self.backup_digest(&config.account_id, &code.code),
                used_at: None,
            })
            .collect();

        self.repository
            .save_pending(StoredTwoFactor {
                account_id: config.account_id.clone(),
                sealed_secret,
                issued_at: config.issued_at,
                confirmed_at: None,
                last_used_step: None,
                backup_codes,
            })
            .await?;

        tracing::info!(account_id = %config.account_id, "Two-factor enrollment started");
        self.events
            .publish(Event::TwoFactorEnrolled {
                account_id: config.account_id.clone(),
                timestamp: config.issued_at,
            })
            .await;

        Ok(enrollment)
    }

    /// Activate a pending enrollment with the first code from the
    /// authenticator app, replacing any active configuration.
    ///
    /// # Errors
    ///
    /// [`TwoFactorError::InvalidCode`] if the code does not belong to the
    /// pending secret, including when that enrollment was replaced while the
    /// code was checked. [`TwoFactorError::AlreadyEnrolled`] if nothing is
    /// pending but two-factor is active, [`TwoFactorError::NotEnrolled`] if
    /// neither exists.
    pub async fn confirm(&self, account_id: &str, code: &str) -> Result<(), Error> {
        let account_id = account_id.trim();
        let Some(pending) = self.repository.find_pending(account_id).await? else {
            return Err(match self.repository.find(account_id).await? {
                Some(_) => TwoFactorError::AlreadyEnrolled.into(),
                None => TwoFactorError::NotEnrolled.into(),
            });
        };

        let now = self.clock.now();
        let secret = self.open_secret(&pending)?;
        let activated = match self.engine.verify_code_step(&secret, code) {
            Some(step) => {
                self.repository
                    .activate(account_id, &pending.sealed_secret, step, now)
                    .await?
            }
            None => false,
        };
        if !activated {
            return Err(self.reject(account_id).await);
        }

        tracing::info!(account_id = %account_id, "Two-factor authentication enabled");
        self.events
            .publish(Event::TwoFactorConfirmed {
                account_id: account_id.to_string(),
                timestamp: now,
            })
            .await;
        Ok(())
    }

    /// Verify a TOTP code for an account with active two-factor.
    ///
    /// # Errors
    ///
    /// [`TwoFactorError::InvalidCode`] for a wrong, stale or replayed code and
    /// [`TwoFactorError::NotEnrolled`] if two-factor is not active.
    pub async fn verify_code(&self, account_id: &str, code: &str) -> Result<(), Error> {
        let stored = self.active(account_id).await?;
        self.consume_code(&stored, code).await
    }

    /// Redeem a backup code for an account with active two-factor.
    ///
    /// # Returns
    ///
    /// The number of unused backup codes left.
    pub async fn verify_backup_code(&self, account_id: &str, code: &str) -> Result<usize, Error> {
        let stored = self.active(account_id).await?;
        let account_id = stored.account_id.as_str();

        let normalized = normalize_backup_code(code);
        let redeemed = normalized.len() == BACKUP_CODE_LENGTH
            && self
                .repository
                .redeem_backup_code(
                    account_id,
                    &self.backup_digest(account_id, &normalized),
                    self.clock.now(),
                )
                .await?;

        if !redeemed {
            return Err(self.reject(account_id).await);
        }

        let remaining = self.remaining_backup_codes(account_id).await?;
        tracing::info!(account_id = %account_id, remaining, "Backup code redeemed");
        if remaining == 0 {
            tracing::warn!(account_id = %account_id, "All backup codes have been used");
        }
        self.events
            .publish(Event::BackupCodeRedeemed {
                account_id: account_id.to_string(),
                remaining,
                timestamp: self.clock.now(),
            })
            .await;
        Ok(remaining)
    }

    /// Remove an account's two-factor configuration.
    ///
    /// # Returns
    ///
    /// `true` if a configuration existed.
    pub async fn disable(&self, account_id: &str) -> Result<bool, Error> {
        let account_id = account_id.trim();
        let deleted = self.repository.delete(account_id).await?;
        if deleted {
            tracing::info!(account_id = %account_id, "Two-factor authentication disabled");
            self.events
                .publish(Event::TwoFactorDisabled {
                    account_id: account_id.to_string(),
                    timestamp: self.clock.now(),
                })
                .await;
        }
        Ok(deleted)
    }

    pub async fn is_enabled(&self, account_id: &str) -> Result<bool, Error> {
        Ok(self.repository.find(account_id.trim()).await?.is_some())
    }

    pub async fn remaining_backup_codes(&self, account_id: &str) -> Result<usize, Error> {
        Ok(self
            .repository
            .find(account_id.trim())
            .await?
            .map(|stored| stored.remaining_backup_codes())
            .unwrap_or(0))
    }

    async fn active(&self, account_id: &str) -> Result<StoredTwoFactor, Error> {
        self.repository
            .find(account_id.trim())
            .await?
            .ok_or_else(|| TwoFactorError::NotEnrolled.into())
    }

    fn open_secret(&self, stored: &StoredTwoFactor) -> Result<String, Error> {
        let secret = self
            .sealer
            .open(&stored.sealed_secret, &secret_aad(&stored.account_id))?;
        String::from_utf8(secret).map_err(|_| CryptoError::Decryption.into())
    }

    async fn consume_code(&self, stored: &StoredTwoFactor, code: &str) -> Result<(), Error> {
        let secret = self.open_secret(stored)?;

        let accepted = match self.engine.verify_code_step(&secret, code) {
            Some(step) => {
                self.repository
                    .consume_step(&stored.account_id, &stored.sealed_secret, step)
                    .await?
            }
            None => false,
        };

        if accepted {
            Ok(())
        } else {
            Err(self.reject(&stored.account_id).await)
        }
    }

    async fn reject(&self, account_id: &str) -> Error {
        tracing::debug!(account_id = %account_id, "Second factor rejected");
        self.events
            .publish(Event::SecondFactorFailed {
                account_id: account_id.to_string(),
                timestamp: self.clock.now(),
            })
            .await;
        TwoFactorError::InvalidCode.into()
    }

    fn backup_digest(&self, account_id: &str, code: &str) -> String {
        self.sealer
            .digest(&format!("{account_id}:{}", normalize_backup_code(code)))
    }
}

fn secret_aad(account_id: &str) -> Vec<u8> {
    format!("rampart:totp-secret:{account_id}").into_bytes()
}
