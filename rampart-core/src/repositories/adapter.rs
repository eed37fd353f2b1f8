use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error,
    repositories::{
        AlertRepository, AttemptRepository, CsrfTokenRepository, RepositoryProvider,
        TwoFactorRepository,
    },
    storage::{
        AlertFilter, AttemptDecision, AttemptRecord, CsrfTokenRecord, FailureOutcome,
        SecurityAlert, SecurityRule, StoredTwoFactor,
    },
};

/// Adapter that wraps a RepositoryProvider and implements individual repository traits
pub struct AttemptRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> AttemptRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> AttemptRepository for AttemptRepositoryAdapter<R> {
    async fn reserve(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptDecision, Error> {
        self.provider.attempts().reserve(rule, key, now).await
    }

    async fn record_failure(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, Error> {
        self.provider.attempts().record_failure(rule, key, now).await
    }

    async fn release(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.provider.attempts().release(rule, key, now).await
    }

    async fn block(
        &self,
        rule: &SecurityRule,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord, Error> {
        self.provider.attempts().block(rule, key, until, now).await
    }

    async fn clear(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        self.provider.attempts().clear(rule_name, key).await
    }

    async fn find(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        self.provider.attempts().find(rule_name, key).await
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.provider.attempts().evict_expired(now).await
    }
}

pub struct AlertRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> AlertRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> AlertRepository for AlertRepositoryAdapter<R> {
    async fn append(&self, alert: SecurityAlert) -> Result<SecurityAlert, Error> {
        self.provider.alerts().append(alert).await
    }

    async fn find(&self, id: &str) -> Result<Option<SecurityAlert>, Error> {
        self.provider.alerts().find(id).await
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error> {
        self.provider.alerts().list(filter).await
    }

    async fn resolve(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<bool, Error> {
        self.provider.alerts().resolve(id, resolved_at).await
    }
}

pub struct CsrfTokenRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> CsrfTokenRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> CsrfTokenRepository for CsrfTokenRepositoryAdapter<R> {
    async fn store(
        &self,
        record: CsrfTokenRecord,
        max_live: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.provider.csrf_tokens().store(record, max_live, now).await
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<CsrfTokenRecord>, Error> {
        self.provider.csrf_tokens().find_by_session(session_id).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<u64, Error> {
        self.provider.csrf_tokens().delete_session(session_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.provider.csrf_tokens().purge_expired(now).await
    }
}

pub struct TwoFactorRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> TwoFactorRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> TwoFactorRepository for TwoFactorRepositoryAdapter<R> {
    async fn save_pending(&self, config: StoredTwoFactor) -> Result<StoredTwoFactor, Error> {
        self.provider.two_factor().save_pending(config).await
    }

    async fn find(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        self.provider.two_factor().find(account_id).await
    }

    async fn find_pending(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        self.provider.two_factor().find_pending(account_id).await
    }

    async fn activate(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.provider
            .two_factor()
            .activate(account_id, sealed_secret, step, at)
            .await
    }

    async fn consume_step(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
    ) -> Result<bool, Error> {
        self.provider
            .two_factor()
            .consume_step(account_id, sealed_secret, step)
            .await
    }

    async fn redeem_backup_code(
        &self,
        account_id: &str,
        digest: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.provider
            .two_factor()
            .redeem_backup_code(account_id, digest, at)
            .await
    }

    async fn delete(&self, account_id: &str) -> Result<bool, Error> {
        self.provider.two_factor().delete(account_id).await
    }
}
