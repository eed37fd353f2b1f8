//! Brute-force and rate-limit tracking.
//!
//! The tracker applies named [`SecurityRule`]s to identities (client
//! addresses, accounts, arbitrary action keys) and appends an alert to the
//! security event log whenever an identity is blocked.
//!
//! # Flow
//!
//! 1. [`SecurityTracker::check_attempt`] before doing the protected work. An
//!    allowed decision holds a slot for the attempt.
//! 2. Report the outcome: [`SecurityTracker::record_failure`],
//!    [`SecurityTracker::record_success`] or, if the attempt never happened,
//!    [`SecurityTracker::release_attempt`]. Unreported slots free themselves
//!    after 30 seconds.
//!
//! # Example
//!
//! ```rust,ignore
//! let decision = tracker.check_attempt("203.0.113.7", SecurityRule::LOGIN_IP).await?;
//! if !decision.allowed {
//!     return Err(RateLimitError::Exceeded { retry_after_ms: decision.retry_after_ms }.into());
//! }
//! ```

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;

use crate::{
    Error,
    clock::Clock,
    error::{ConfigurationError, ValidationError},
    events::{Event, EventBus, UnblockReason},
    repositories::{AlertRepository, AttemptRepository},
    storage::{
        AlertFilter, AlertSeverity, AlertType, AttemptDecision, AttemptRecord, MAX_RULE_DURATION_MS,
        RuleScope, SecurityAlert, SecurityRule,
    },
    validation::{SanitizeOptions, sanitize},
};

const MAX_ALERT_MESSAGE_LENGTH: usize = 500;

/// Service enforcing security rules against identities.
///
/// # Thread Safety
///
/// The tracker is shared behind an `Arc`. Rules can be toggled or replaced at
/// runtime; every store operation is atomic per `(rule, identity)`.
pub struct SecurityTracker<A: AttemptRepository, L: AlertRepository> {
    attempts: Arc<A>,
    alerts: Arc<L>,
    rules: DashMap<String, SecurityRule>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<A: AttemptRepository, L: AlertRepository> SecurityTracker<A, L> {
    /// Create a tracker enforcing `rules`.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::InvalidRule`] if a rule cannot be enforced or two
    /// rules share a name.
    pub fn new(
        attempts: Arc<A>,
        alerts: Arc<L>,
        rules: Vec<SecurityRule>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, ConfigurationError> {
        let map = DashMap::new();
        for rule in rules {
            rule.validate()?;
            if map.contains_key(&rule.name) {
                return Err(ConfigurationError::InvalidRule(format!(
                    "{}: duplicate rule name",
                    rule.name
                )));
            }
            map.insert(rule.name.clone(), rule);
        }

        Ok(Self {
            attempts,
            alerts,
            rules: map,
            clock,
            events,
        })
    }

    /// Check whether `identity_key` may attempt the action guarded by
    /// `rule_name`, holding a slot if it may.
    ///
    /// Disabled rules always allow and hold nothing.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::UnknownRule`] for a rule that is not configured,
    /// and any storage error. Neither is ever turned into an allow.
    pub async fn check_attempt(
        &self,
        identity_key: &str,
        rule_name: &str,
    ) -> Result<AttemptDecision, Error> {
        let rule = self.rule(rule_name)?;
        if !rule.enabled {
            return Ok(AttemptDecision::allow(0, rule.max_attempts));
        }

        let key = normalize_identity(&rule, identity_key)?;
        let decision = self
            .attempts
            .reserve(&rule, &key, self.clock.now())
            .await?;

        if !decision.allowed {
            tracing::debug!(
                rule = %rule.name,
                retry_after_ms = decision.retry_after_ms,
                "Attempt denied"
            );
        }

        Ok(decision)
    }

    /// Count a failed attempt.
    ///
    /// Reaching the rule's threshold blocks the identity for
    /// `block_duration_ms` and appends the rule's alert. One failure before
    /// the threshold a `multiple_failures` alert is appended for rules that
    /// allow more than two attempts.
    pub async fn record_failure(
        &self,
        identity_key: &str,
        rule_name: &str,
    ) -> Result<AttemptRecord, Error> {
        let rule = self.rule(rule_name)?;
        let key = normalize_identity(&rule, identity_key)?;
        let now = self.clock.now();
        if !rule.enabled {
            return Ok(AttemptRecord::new(key, rule.name, now));
        }

        let outcome = self.attempts.record_failure(&rule, &key, now).await?;
        let record = outcome.record;

        self.events
            .publish(Event::AttemptFailed {
                rule_name: rule.name.clone(),
                identity_key: key.clone(),
                failures: record.count,
                timestamp: now,
            })
            .await;

        if outcome.newly_blocked {
            let blocked_until = record.blocked_until.unwrap_or(now);
            tracing::warn!(
                rule = %rule.name,
                failures = record.count,
                blocked_until = %blocked_until,
                "Identity blocked after repeated failures"
            );

            let message = format!(
                "Blocked after {} failed attempts within {}s",
                record.count,
                rule.window_ms / 1000
            );
            self.append_alert(
                SecurityAlert::new(rule.alert_type, rule.severity, &key, message, now)?
                    .with_rule(&rule.name),
            )
            .await?;

            self.events
                .publish(Event::IdentityBlocked {
                    rule_name: rule.name.clone(),
                    identity_key: key,
                    blocked_until,
                    timestamp: now,
                })
                .await;
        } else if outcome.approaching_limit {
            let message = format!(
                "{} failed attempts, one more will block",
                record.count
            );
            self.append_alert(
                SecurityAlert::new(
                    AlertType::MultipleFailures,
                    AlertSeverity::Medium,
                    &key,
                    message,
                    now,
                )?
                .with_rule(&rule.name),
            )
            .await?;
        }

        Ok(record)
    }

    /// Report a successful attempt.
    ///
    /// Rules with `reset_on_success` forget the identity entirely; the others
    /// only give back the slot the attempt held.
    pub async fn record_success(&self, identity_key: &str, rule_name: &str) -> Result<(), Error> {
        let rule = self.rule(rule_name)?;
        if !rule.enabled {
            return Ok(());
        }
        let key = normalize_identity(&rule, identity_key)?;
        let now = self.clock.now();

        if !rule.reset_on_success {
            return self.attempts.release(&rule, &key, now).await;
        }

        let cleared = self.attempts.clear(&rule.name, &key).await?;
        if cleared.is_some_and(|record| record.is_blocked(now)) {
            self.events
                .publish(Event::IdentityUnblocked {
                    rule_name: rule.name.clone(),
                    identity_key: key,
                    reason: UnblockReason::Success,
                    timestamp: now,
                })
                .await;
        }
        Ok(())
    }

    /// Give back the slot held by an attempt that was never made.
    pub async fn release_attempt(&self, identity_key: &str, rule_name: &str) -> Result<(), Error> {
        let rule = self.rule(rule_name)?;
        if !rule.enabled {
            return Ok(());
        }
        let key = normalize_identity(&rule, identity_key)?;
        self.attempts.release(&rule, &key, self.clock.now()).await
    }

    /// Check several `(rule_name, identity_key)` pairs as one decision.
    ///
    /// The attempt is allowed only if every rule allows it. When any rule
    /// denies, the slots taken on the others are given back and the longest
    /// wait is returned, without saying which rule denied.
    pub async fn check_all(&self, checks: &[(&str, &str)]) -> Result<AttemptDecision, Error> {
        let mut admitted: Vec<(&str, &str)> = Vec::with_capacity(checks.len());
        let mut retry_after_ms = 0u64;
        let mut failures = 0u32;
        let mut remaining = u32::MAX;

        for &(rule_name, identity_key) in checks {
            let decision = match self.check_attempt(identity_key, rule_name).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.release_all(&admitted).await;
                    return Err(e);
                }
            };

            failures = failures.max(decision.failures);
            if decision.allowed {
                remaining = remaining.min(decision.remaining);
                admitted.push((rule_name, identity_key));
            } else {
                retry_after_ms = retry_after_ms.max(decision.retry_after_ms);
            }
        }

        if retry_after_ms > 0 {
            self.release_all(&admitted).await;
            return Ok(AttemptDecision::deny(retry_after_ms, failures));
        }

        Ok(AttemptDecision::allow(
            failures,
            if checks.is_empty() { 0 } else { remaining },
        ))
    }

    async fn release_all(&self, admitted: &[(&str, &str)]) {
        for &(rule_name, identity_key) in admitted {
            if let Err(e) = self.release_attempt(identity_key, rule_name).await {
                tracing::warn!(error = %e, rule = %rule_name, "Failed to release attempt slot");
            }
        }
    }

    /// Mark an alert resolved.
    ///
    /// # Returns
    ///
    /// `false` if the alert is unknown or was already resolved.
    pub async fn resolve_alert(&self, alert_id: &str) -> Result<bool, Error> {
        let now = self.clock.now();
        let resolved = self.alerts.resolve(alert_id, now).await?;
        if resolved {
            tracing::info!(alert_id = %alert_id, "Security alert resolved");
            self.events
                .publish(Event::AlertResolved {
                    alert_id: alert_id.to_string(),
                    timestamp: now,
                })
                .await;
        }
        Ok(resolved)
    }

    pub async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error> {
        self.alerts.list(filter).await
    }

    /// Append an alert for a security action taken outside the tracker.
    ///
    /// The message is treated as untrusted text: markup is removed and it is
    /// capped at 500 characters.
    pub async fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        identity: &str,
        message: &str,
    ) -> Result<SecurityAlert, Error> {
        let message = sanitize(
            message,
            &SanitizeOptions::plain_text().with_max_length(MAX_ALERT_MESSAGE_LENGTH),
        );
        let alert = SecurityAlert::new(
            alert_type,
            severity,
            identity.trim(),
            message,
            self.clock.now(),
        )?;
        self.append_alert(alert).await
    }

    /// Block an identity under a rule for `duration`, whatever its history.
    pub async fn block_identity(
        &self,
        identity_key: &str,
        rule_name: &str,
        duration: Duration,
    ) -> Result<AttemptRecord, Error> {
        let rule = self.rule(rule_name)?;
        let key = normalize_identity(&rule, identity_key)?;

        let millis = duration.num_milliseconds();
        if millis <= 0 || millis as u64 > MAX_RULE_DURATION_MS {
            return Err(ConfigurationError::InvalidValue(
                "block duration must be between 1ms and 365 days".to_string(),
            )
            .into());
        }

        let now = self.clock.now();
        let until = now + duration;
        let record = self.attempts.block(&rule, &key, until, now).await?;

        tracing::warn!(rule = %rule.name, blocked_until = %until, "Identity blocked manually");

        let alert_type = match rule.scope {
            RuleScope::Ip => AlertType::IpBlocked,
            RuleScope::Account | RuleScope::Action => AlertType::EmailBlocked,
        };
        self.append_alert(
            SecurityAlert::new(
                alert_type,
                rule.severity,
                &key,
                format!("Blocked manually for {}s", duration.num_seconds()),
                now,
            )?
            .with_rule(&rule.name),
        )
        .await?;

        self.events
            .publish(Event::IdentityBlocked {
                rule_name: rule.name.clone(),
                identity_key: key,
                blocked_until: until,
                timestamp: now,
            })
            .await;

        Ok(record)
    }

    /// Forget everything recorded about an identity under a rule.
    ///
    /// # Returns
    ///
    /// `true` if the identity was blocked.
    pub async fn unblock_identity(&self, identity_key: &str, rule_name: &str) -> Result<bool, Error> {
        let rule = self.rule(rule_name)?;
        let key = normalize_identity(&rule, identity_key)?;
        let now = self.clock.now();

        let was_blocked = self
            .attempts
            .clear(&rule.name, &key)
            .await?
            .is_some_and(|record| record.is_blocked(now));

        if was_blocked {
            tracing::info!(rule = %rule.name, "Identity unblocked manually");
            self.events
                .publish(Event::IdentityUnblocked {
                    rule_name: rule.name.clone(),
                    identity_key: key,
                    reason: UnblockReason::Manual,
                    timestamp: now,
                })
                .await;
        }
        Ok(was_blocked)
    }

    /// The configured rules, ordered by name.
    pub fn rules(&self) -> Vec<SecurityRule> {
        let mut rules: Vec<SecurityRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    pub fn set_rule_enabled(&self, rule_name: &str, enabled: bool) -> Result<(), Error> {
        let mut rule = self
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| ConfigurationError::UnknownRule(rule_name.to_string()))?;
        rule.enabled = enabled;
        tracing::info!(rule = %rule_name, enabled, "Security rule toggled");
        Ok(())
    }

    /// Add a rule or replace the rule with the same name. Existing attempt
    /// records are kept and judged by the new limits from now on.
    pub fn upsert_rule(&self, rule: SecurityRule) -> Result<(), Error> {
        rule.validate()?;
        tracing::info!(rule = %rule.name, "Security rule updated");
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub async fn attempt_record(
        &self,
        identity_key: &str,
        rule_name: &str,
    ) -> Result<Option<AttemptRecord>, Error> {
        let rule = self.rule(rule_name)?;
        let key = normalize_identity(&rule, identity_key)?;
        self.attempts.find(&rule.name, &key).await
    }

    /// Evict attempt records that no longer affect any decision.
    pub async fn sweep_expired(&self) -> Result<u64, Error> {
        self.attempts.evict_expired(self.clock.now()).await
    }

    /// Start the background sweep task.
    ///
    /// # Arguments
    ///
    /// * `interval` - How often expired records are evicted
    /// * `shutdown` - A watch receiver that signals when to stop the task
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task.
    pub fn start_sweep_task(
        &self,
        interval: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let attempts = Arc::clone(&self.attempts);
        let clock = Arc::clone(&self.clock);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        match attempts.evict_expired(clock.now()).await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count = count, "Evicted expired attempt records");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to evict expired attempt records");
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down attempt record sweep task");
                        break;
                    }
                }
            }
        })
    }

    fn rule(&self, rule_name: &str) -> Result<SecurityRule, Error> {
        self.rules
            .get(rule_name)
            .map(|rule| rule.value().clone())
            .ok_or_else(|| ConfigurationError::UnknownRule(rule_name.to_string()).into())
    }

    async fn append_alert(&self, alert: SecurityAlert) -> Result<SecurityAlert, Error> {
        let alert = self.alerts.append(alert).await?;
        self.events
            .publish(Event::AlertRaised {
                alert_id: alert.id.clone(),
                alert_type: alert.alert_type,
                severity: alert.severity,
                identity: alert.identity.clone(),
                timestamp: alert.timestamp,
            })
            .await;
        Ok(alert)
    }
}

fn normalize_identity(rule: &SecurityRule, identity_key: &str) -> Result<String, Error> {
    let key = rule.scope.normalize_key(identity_key);
    if key.is_empty() {
        return Err(ValidationError::MissingField("identity_key".to_string()).into());
    }
    Ok(key)
}
