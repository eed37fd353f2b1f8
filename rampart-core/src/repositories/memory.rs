//! In-process storage backend
//!
//! Suitable for a single instance and for tests. Atomicity per key comes from
//! `DashMap` entry locking: a shard lock is held while a record is loaded,
//! transitioned and written back, and never across an `.await`.
//!
//! Deployments with more than one instance must use a shared store so that
//! limits hold across instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::{
    Error,
    crypto::constant_time_compare,
    repositories::{
        AlertRepository, AlertRepositoryProvider, AttemptRepository, AttemptRepositoryProvider,
        CsrfTokenRepository, CsrfTokenRepositoryProvider, RepositoryProvider,
        TwoFactorRepository, TwoFactorRepositoryProvider,
    },
    storage::{
        AlertFilter, AttemptDecision, AttemptRecord, CsrfTokenRecord, FailureOutcome,
        SecurityAlert, SecurityRule, StoredTwoFactor,
    },
};

type AttemptKey = (String, String);

fn attempt_key(rule_name: &str, key: &str) -> AttemptKey {
    (rule_name.to_string(), key.to_string())
}

#[derive(Default)]
pub struct InMemoryAttemptRepository {
    records: DashMap<AttemptKey, AttemptRecord>,
}

impl InMemoryAttemptRepository {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AttemptRepository for InMemoryAttemptRepository {
    async fn reserve(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptDecision, Error> {
        let mut record = self
            .records
            .entry(attempt_key(&rule.name, key))
            .or_insert_with(|| AttemptRecord::new(key, &rule.name, now));
        Ok(record.reserve(rule, now))
    }

    async fn record_failure(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, Error> {
        let mut record = self
            .records
            .entry(attempt_key(&rule.name, key))
            .or_insert_with(|| AttemptRecord::new(key, &rule.name, now));
        Ok(record.register_failure(rule, now))
    }

    async fn release(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if let Some(mut record) = self.records.get_mut(&attempt_key(&rule.name, key)) {
            record.release(rule, now);
        }
        Ok(())
    }

    async fn block(
        &self,
        rule: &SecurityRule,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord, Error> {
        let mut record = self
            .records
            .entry(attempt_key(&rule.name, key))
            .or_insert_with(|| AttemptRecord::new(key, &rule.name, now));
        record.block_until(rule, until, now);
        Ok(record.clone())
    }

    async fn clear(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        Ok(self
            .records
            .remove(&attempt_key(rule_name, key))
            .map(|(_, record)| record))
    }

    async fn find(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        Ok(self
            .records
            .get(&attempt_key(rule_name, key))
            .map(|record| record.clone()))
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryAlertRepository {
    alerts: RwLock<Vec<SecurityAlert>>,
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn append(&self, alert: SecurityAlert) -> Result<SecurityAlert, Error> {
        self.alerts.write().await.push(alert.clone());
        Ok(alert)
    }

    async fn find(&self, id: &str) -> Result<Option<SecurityAlert>, Error> {
        Ok(self
            .alerts
            .read()
            .await
            .iter()
            .find(|alert| alert.id == id)
            .cloned())
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error> {
        let alerts = self.alerts.read().await;
        let mut matching: Vec<SecurityAlert> = alerts
            .iter()
            .rev()
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect();
        // Stable, so insertion order breaks timestamp ties newest first.
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn resolve(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<bool, Error> {
        let mut alerts = self.alerts.write().await;
        match alerts
            .iter_mut()
            .find(|alert| alert.id == id && !alert.resolved)
        {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(resolved_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryCsrfTokenRepository {
    sessions: DashMap<String, Vec<CsrfTokenRecord>>,
}

#[async_trait]
impl CsrfTokenRepository for InMemoryCsrfTokenRepository {
    async fn store(
        &self,
        record: CsrfTokenRecord,
        max_live: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tokens = self.sessions.entry(record.session_id.clone()).or_default();
        tokens.retain(|t| !t.is_expired(now));
        tokens.push(record);
        let excess = tokens.len().saturating_sub(max_live.max(1));
        tokens.drain(..excess);
        Ok(())
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<CsrfTokenRecord>, Error> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|tokens| tokens.clone())
            .unwrap_or_default())
    }

    async fn delete_session(&self, session_id: &str) -> Result<u64, Error> {
        Ok(self
            .sessions
            .remove(session_id)
            .map(|(_, tokens)| tokens.len() as u64)
            .unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut purged = 0u64;
        self.sessions.retain(|_, tokens| {
            let before = tokens.len();
            tokens.retain(|t| !t.is_expired(now));
            purged += (before - tokens.len()) as u64;
            !tokens.is_empty()
        });
        Ok(purged)
    }
}

#[derive(Default)]
pub struct InMemoryTwoFactorRepository {
    active: DashMap<String, StoredTwoFactor>,
    pending: DashMap<String, StoredTwoFactor>,
}

#[async_trait]
impl TwoFactorRepository for InMemoryTwoFactorRepository {
    async fn save_pending(&self, config: StoredTwoFactor) -> Result<StoredTwoFactor, Error> {
        self.pending
            .insert(config.account_id.clone(), config.clone());
        Ok(config)
    }

    async fn find(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        Ok(self.active.get(account_id).map(|config| config.clone()))
    }

    async fn find_pending(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        Ok(self.pending.get(account_id).map(|config| config.clone()))
    }

    async fn activate(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        // Holding the active entry keeps `delete` out until the swap is done.
        let entry = self.active.entry(account_id.to_string());
        let Some((_, mut config)) = self
            .pending
            .remove_if(account_id, |_, pending| pending.sealed_secret == sealed_secret)
        else {
            return Ok(false);
        };
        config.confirmed_at = Some(at);
        config.last_used_step = Some(step);
        entry.insert(config);
        Ok(true)
    }

    async fn consume_step(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
    ) -> Result<bool, Error> {
        let Some(mut config) = self.active.get_mut(account_id) else {
            return Ok(false);
        };
        if config.sealed_secret != sealed_secret
            || config.last_used_step.is_some_and(|last| last >= step)
        {
            return Ok(false);
        }
        config.last_used_step = Some(step);
        Ok(true)
    }

    async fn redeem_backup_code(
        &self,
        account_id: &str,
        digest: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let Some(mut config) = self.active.get_mut(account_id) else {
            return Ok(false);
        };
        match config.backup_codes.iter_mut().find(|code| {
            code.used_at.is_none() && constant_time_compare(code.digest.as_bytes(), digest.as_bytes())
        }) {
            Some(code) => {
                code.used_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, account_id: &str) -> Result<bool, Error> {
        let active = self.active.remove(account_id).is_some();
        let pending = self.pending.remove(account_id).is_some();
        Ok(active || pending)
    }
}

/// Storage backend keeping everything in process memory.
#[derive(Default)]
pub struct InMemoryRepositoryProvider {
    attempts: InMemoryAttemptRepository,
    alerts: InMemoryAlertRepository,
    csrf_tokens: InMemoryCsrfTokenRepository,
    two_factor: InMemoryTwoFactorRepository,
}

impl InMemoryRepositoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttemptRepositoryProvider for InMemoryRepositoryProvider {
    type AttemptRepo = InMemoryAttemptRepository;

    fn attempts(&self) -> &Self::AttemptRepo {
        &self.attempts
    }
}

impl AlertRepositoryProvider for InMemoryRepositoryProvider {
    type AlertRepo = InMemoryAlertRepository;

    fn alerts(&self) -> &Self::AlertRepo {
        &self.alerts
    }
}

impl CsrfTokenRepositoryProvider for InMemoryRepositoryProvider {
    type CsrfTokenRepo = InMemoryCsrfTokenRepository;

    fn csrf_tokens(&self) -> &Self::CsrfTokenRepo {
        &self.csrf_tokens
    }
}

impl TwoFactorRepositoryProvider for InMemoryRepositoryProvider {
    type TwoFactorRepo = InMemoryTwoFactorRepository;

    fn two_factor(&self) -> &Self::TwoFactorRepo {
        &self.two_factor
    }
}

#[async_trait]
impl RepositoryProvider for InMemoryRepositoryProvider {
    async fn migrate(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
