//! Entities shared by the services and the storage backends.
//!
//! The rolling-window arithmetic for attempt tracking lives on
//! [`AttemptRecord`] itself. Backends load a record, apply one of its
//! transitions and write it back inside a single atomic section, so every
//! backend enforces exactly the same limits.

use std::{collections::VecDeque, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::hash_token,
    error::{ConfigurationError, CryptoError},
    id::{ALERT_PREFIX, generate_prefixed_id},
};

/// How long an admitted attempt holds its slot if the caller never reports
/// the outcome.
pub const RESERVATION_TTL_MS: u64 = 30_000;

/// Upper bound for any configured window, block or penalty.
pub const MAX_RULE_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms.min(MAX_RULE_DURATION_MS)).unwrap_or(i64::MAX))
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.num_milliseconds()).unwrap_or(0)
}

// ============================================================================
// Rules
// ============================================================================

/// What kind of identity a rule counts against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// A client network address.
    Ip,
    /// An account identifier such as an email address.
    Account,
    /// Any other caller-chosen key (API credential, admin principal).
    Action,
}

impl RuleScope {
    /// Canonical form of an identity key for this scope.
    ///
    /// Account keys are case-insensitive so `Alice@Example.com` and
    /// `alice@example.com` share one counter.
    pub fn normalize_key(&self, key: &str) -> String {
        match self {
            RuleScope::Account => key.trim().to_lowercase(),
            RuleScope::Ip | RuleScope::Action => key.trim().to_string(),
        }
    }
}

/// A named limit applied to one kind of identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityRule {
    pub name: String,
    pub scope: RuleScope,
    pub max_attempts: u32,
    pub window_ms: u64,
    pub block_duration_ms: u64,
    /// Minimum spacing enforced after each failure, before the hard block.
    #[serde(default)]
    pub penalty_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub reset_on_success: bool,
    pub alert_type: AlertType,
    #[serde(default = "default_severity")]
    pub severity: AlertSeverity,
}

fn default_true() -> bool {
    true
}

fn default_severity() -> AlertSeverity {
    AlertSeverity::High
}

impl SecurityRule {
    pub const LOGIN_IP: &'static str = "login_ip";
    pub const LOGIN_EMAIL: &'static str = "login_email";
    pub const TWO_FACTOR: &'static str = "two_factor";
    pub const PASSWORD_RESET: &'static str = "password_reset";
    pub const ADMIN_ACTION: &'static str = "admin_action";

    /// Create an enabled rule. The alert raised on block follows the scope:
    /// `brute_force` for addresses, `email_blocked` for accounts and
    /// `suspicious_activity` for everything else.
    pub fn new(
        name: impl Into<String>,
        scope: RuleScope,
        max_attempts: u32,
        window_ms: u64,
        block_duration_ms: u64,
    ) -> Self {
        let alert_type = match scope {
            RuleScope::Ip => AlertType::BruteForce,
            RuleScope::Account => AlertType::EmailBlocked,
            RuleScope::Action => AlertType::SuspiciousActivity,
        };

        Self {
            name: name.into(),
            scope,
            max_attempts,
            window_ms,
            block_duration_ms,
            penalty_ms: 0,
            enabled: true,
            reset_on_success: true,
            alert_type,
            severity: AlertSeverity::High,
        }
    }

    pub fn with_penalty(mut self, penalty_ms: u64) -> Self {
        self.penalty_ms = penalty_ms;
        self
    }

    pub fn with_alert(mut self, alert_type: AlertType, severity: AlertSeverity) -> Self {
        self.alert_type = alert_type;
        self.severity = severity;
        self
    }

    pub fn with_reset_on_success(mut self, reset: bool) -> Self {
        self.reset_on_success = reset;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check that the rule can be enforced.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| {
            Err(ConfigurationError::InvalidRule(format!(
                "{}: {reason}",
                if self.name.is_empty() {
                    "<unnamed>"
                } else {
                    self.name.as_str()
                }
            )))
        };

        if self.name.trim().is_empty() {
            return invalid("name must not be empty");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.window_ms == 0 || self.window_ms > MAX_RULE_DURATION_MS {
            return invalid("window_ms must be between 1ms and 365 days");
        }
        if self.block_duration_ms == 0 || self.block_duration_ms > MAX_RULE_DURATION_MS {
            return invalid("block_duration_ms must be between 1ms and 365 days");
        }
        if self.penalty_ms > MAX_RULE_DURATION_MS {
            return invalid("penalty_ms must not exceed 365 days");
        }
        Ok(())
    }

    /// The rule set used when no configuration is supplied.
    pub fn defaults() -> Vec<SecurityRule> {
        const MINUTE: u64 = 60 * 1000;

        vec![
            SecurityRule::new(Self::LOGIN_IP, RuleScope::Ip, 20, 15 * MINUTE, 30 * MINUTE)
                .with_reset_on_success(false)
                .with_alert(AlertType::BruteForce, AlertSeverity::High),
            SecurityRule::new(
                Self::LOGIN_EMAIL,
                RuleScope::Account,
                5,
                15 * MINUTE,
                15 * MINUTE,
            )
            .with_alert(AlertType::EmailBlocked, AlertSeverity::High),
            SecurityRule::new(Self::TWO_FACTOR, RuleScope::Account, 5, 5 * MINUTE, 15 * MINUTE)
                .with_alert(AlertType::EmailBlocked, AlertSeverity::High),
            SecurityRule::new(
                Self::PASSWORD_RESET,
                RuleScope::Account,
                3,
                60 * MINUTE,
                60 * MINUTE,
            )
            .with_alert(AlertType::EmailBlocked, AlertSeverity::Medium),
            SecurityRule::new(Self::ADMIN_ACTION, RuleScope::Ip, 10, MINUTE, 10 * MINUTE)
                .with_reset_on_success(false)
                .with_alert(AlertType::SuspiciousActivity, AlertSeverity::Critical),
        ]
    }
}

// ============================================================================
// Attempt tracking
// ============================================================================

/// Per `(rule, identity)` attempt state.
///
/// `failures` holds the timestamps of failures still inside the rolling
/// window, so the limit holds over every `window_ms` interval rather than over
/// fixed buckets. `pending` holds attempts that were admitted by a check but
/// whose outcome has not been reported yet; they occupy a slot so concurrent
/// callers cannot collectively get past the limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    pub identity_key: String,
    pub rule_name: String,
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub failures: VecDeque<DateTime<Utc>>,
    pub pending: VecDeque<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Result of an attempt check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDecision {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after_ms: u64,
    /// Failures currently inside the window.
    pub failures: u32,
    /// Attempts still available before the limit, counting in-flight ones.
    pub remaining: u32,
}

impl AttemptDecision {
    pub fn allow(failures: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
            failures,
            remaining,
        }
    }

    pub fn deny(retry_after_ms: u64, failures: u32) -> Self {
        Self {
            allowed: false,
            retry_after_ms: retry_after_ms.max(1),
            failures,
            remaining: 0,
        }
    }
}

/// Result of recording a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub record: AttemptRecord,
    /// This failure crossed the threshold and started a block.
    pub newly_blocked: bool,
    /// One more failure will block.
    pub approaching_limit: bool,
}

impl AttemptRecord {
    pub fn new(
        identity_key: impl Into<String>,
        rule_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identity_key: identity_key.into(),
            rule_name: rule_name.into(),
            count: 0,
            window_start: now,
            blocked_until: None,
            failures: VecDeque::new(),
            pending: VecDeque::new(),
            expires_at: now,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// The record carries no state that still affects a decision.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now && !self.is_blocked(now)
    }

    /// Drop failures and reservations that have aged out, and forget a block
    /// that has lapsed together with the failures that caused it.
    pub fn prune(&mut self, rule: &SecurityRule, now: DateTime<Utc>) {
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
            self.failures.clear();
        }

        let window_floor = now - millis(rule.window_ms);
        while self.failures.front().is_some_and(|t| *t <= window_floor) {
            self.failures.pop_front();
        }

        let reservation_floor = now - millis(RESERVATION_TTL_MS);
        while self.pending.front().is_some_and(|t| *t <= reservation_floor) {
            self.pending.pop_front();
        }

        self.sync(rule, now);
    }

    /// Why the next attempt would be refused, if it would be.
    pub fn retry_after(&self, rule: &SecurityRule, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(until) = self.blocked_until.filter(|until| *until > now) {
            return Some(until - now);
        }

        if rule.penalty_ms > 0 {
            if let Some(last) = self.failures.back() {
                let free_at = *last + millis(rule.penalty_ms);
                if free_at > now {
                    return Some(free_at - now);
                }
            }
        }

        None
    }

    /// Check the limit and, if the attempt is allowed, hold a slot for it.
    pub fn reserve(&mut self, rule: &SecurityRule, now: DateTime<Utc>) -> AttemptDecision {
        self.prune(rule, now);

        if let Some(wait) = self.retry_after(rule, now) {
            return AttemptDecision::deny(as_millis(wait), self.count);
        }

        let in_flight = self.failures.len() + self.pending.len();
        if in_flight >= rule.max_attempts as usize {
            // Every slot is taken by a failure or an unreported attempt; a slot
            // frees when the oldest of either ages out.
            let failure_frees = self.failures.front().map(|t| *t + millis(rule.window_ms));
            let reservation_frees = self
                .pending
                .front()
                .map(|t| *t + millis(RESERVATION_TTL_MS));
            let wait = [failure_frees, reservation_frees]
                .into_iter()
                .flatten()
                .min()
                .map(|at| as_millis(at - now))
                .unwrap_or(1);
            return AttemptDecision::deny(wait, self.count);
        }

        self.pending.push_back(now);
        self.sync(rule, now);

        let remaining = rule.max_attempts as usize - in_flight - 1;
        AttemptDecision::allow(self.count, remaining as u32)
    }

    /// Count a failure, consuming one reservation if there is one.
    pub fn register_failure(&mut self, rule: &SecurityRule, now: DateTime<Utc>) -> FailureOutcome {
        self.prune(rule, now);
        self.pending.pop_front();

        if self.is_blocked(now) {
            self.sync(rule, now);
            return FailureOutcome {
                record: self.clone(),
                newly_blocked: false,
                approaching_limit: false,
            };
        }

        self.failures.push_back(now);
        let newly_blocked = self.failures.len() >= rule.max_attempts as usize;
        if newly_blocked {
            self.blocked_until = Some(now + millis(rule.block_duration_ms));
        }
        self.sync(rule, now);

        let approaching_limit =
            !newly_blocked && rule.max_attempts > 2 && self.count + 1 == rule.max_attempts;

        FailureOutcome {
            record: self.clone(),
            newly_blocked,
            approaching_limit,
        }
    }

    /// Give back one reservation without counting a failure.
    pub fn release(&mut self, rule: &SecurityRule, now: DateTime<Utc>) {
        self.prune(rule, now);
        self.pending.pop_front();
        self.sync(rule, now);
    }

    /// Block the identity until `until` regardless of its failure count.
    pub fn block_until(&mut self, rule: &SecurityRule, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.prune(rule, now);
        self.blocked_until = Some(until);
        self.sync(rule, now);
    }

    fn sync(&mut self, rule: &SecurityRule, now: DateTime<Utc>) {
        self.count = self.failures.len() as u32;
        self.window_start = self.failures.front().copied().unwrap_or(now);

        let mut expires_at = now;
        if let Some(last) = self.failures.back() {
            expires_at = expires_at
                .max(*last + millis(rule.window_ms))
                .max(*last + millis(rule.penalty_ms));
        }
        if let Some(last) = self.pending.back() {
            expires_at = expires_at.max(*last + millis(RESERVATION_TTL_MS));
        }
        if let Some(until) = self.blocked_until {
            expires_at = expires_at.max(until);
        }
        self.expires_at = expires_at;
    }
}

// ============================================================================
// Security alerts
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BruteForce,
    SuspiciousActivity,
    MultipleFailures,
    IpBlocked,
    EmailBlocked,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BruteForce => "brute_force",
            AlertType::SuspiciousActivity => "suspicious_activity",
            AlertType::MultipleFailures => "multiple_failures",
            AlertType::IpBlocked => "ip_blocked",
            AlertType::EmailBlocked => "email_blocked",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brute_force" => Ok(AlertType::BruteForce),
            "suspicious_activity" => Ok(AlertType::SuspiciousActivity),
            "multiple_failures" => Ok(AlertType::MultipleFailures),
            "ip_blocked" => Ok(AlertType::IpBlocked),
            "email_blocked" => Ok(AlertType::EmailBlocked),
            other => Err(ConfigurationError::InvalidValue(format!(
                "unknown alert type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(ConfigurationError::InvalidValue(format!(
                "unknown alert severity: {other}"
            ))),
        }
    }
}

/// An entry in the security event log. Alerts are never deleted; the only
/// mutation is resolving them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub identity: String,
    pub rule_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SecurityAlert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        identity: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            id: generate_prefixed_id(ALERT_PREFIX)?,
            alert_type,
            severity,
            identity: identity.into(),
            rule_name: None,
            message: message.into(),
            timestamp,
            resolved: false,
            resolved_at: None,
        })
    }

    pub fn with_rule(mut self, rule_name: impl Into<String>) -> Self {
        self.rule_name = Some(rule_name.into());
        self
    }
}

/// Selection criteria for listing alerts. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub resolved: Option<bool>,
    pub alert_type: Option<AlertType>,
    pub min_severity: Option<AlertSeverity>,
    pub identity: Option<String>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn unresolved() -> Self {
        Self {
            resolved: Some(false),
            ..Default::default()
        }
    }

    pub fn matches(&self, alert: &SecurityAlert) -> bool {
        self.resolved.is_none_or(|r| alert.resolved == r)
            && self.alert_type.is_none_or(|t| alert.alert_type == t)
            && self.min_severity.is_none_or(|s| alert.severity >= s)
            && self
                .identity
                .as_deref()
                .is_none_or(|identity| alert.identity == identity)
    }
}

// ============================================================================
// Two-factor authentication
// ============================================================================

/// A one-time recovery code. `used` only ever goes from `false` to `true`.
#[derive(Clone, PartialEq, Eq)]
pub struct BackupCode {
    pub code: String,
    pub used: bool,
}

impl BackupCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            used: false,
        }
    }
}

impl fmt::Debug for BackupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupCode")
            .field("code", &"[REDACTED]")
            .field("used", &self.used)
            .finish()
    }
}

/// A TOTP secret and its backup codes, in plaintext. This is the form handed
/// to the user once at enrollment; it is never persisted as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct TwoFactorConfig {
    pub account_id: String,
    /// Base32 (RFC 4648, unpadded) encoded secret.
    pub secret: String,
    pub issued_at: DateTime<Utc>,
    pub backup_codes: Vec<BackupCode>,
}

impl TwoFactorConfig {
    pub fn remaining_backup_codes(&self) -> usize {
        self.backup_codes.iter().filter(|c| !c.used).count()
    }
}

impl fmt::Debug for TwoFactorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoFactorConfig")
            .field("account_id", &self.account_id)
            .field("secret", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .field("backup_codes", &self.backup_codes.len())
            .finish()
    }
}

/// Everything the user needs to set up an authenticator app.
#[derive(Clone)]
pub struct TwoFactorEnrollment {
    pub config: TwoFactorConfig,
    /// `otpauth://` URI, usually rendered as a QR code.
    pub otpauth_uri: String,
}

impl fmt::Debug for TwoFactorEnrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoFactorEnrollment")
            .field("config", &self.config)
            .field("otpauth_uri", &"[REDACTED]")
            .finish()
    }
}

/// Persisted form of a backup code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredBackupCode {
    /// Keyed digest of the normalized code.
    pub digest: String,
    pub used_at: Option<DateTime<Utc>>,
}

/// Persisted form of a two-factor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTwoFactor {
    pub account_id: String,
    /// Secret sealed with authenticated encryption.
    pub sealed_secret: String,
    pub issued_at: DateTime<Utc>,
    /// Set once the user proves possession of the secret.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Highest TOTP time step accepted so far, for replay protection.
    pub last_used_step: Option<u64>,
    pub backup_codes: Vec<StoredBackupCode>,
}

impl StoredTwoFactor {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }

    pub fn remaining_backup_codes(&self) -> usize {
        self.backup_codes
            .iter()
            .filter(|c| c.used_at.is_none())
            .count()
    }
}

// ============================================================================
// CSRF
// ============================================================================

/// An anti-forgery token bound to one session.
#[derive(Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for CsrfToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfToken")
            .field("value", &"[REDACTED]")
            .field("session_id", &self.session_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Persisted form of a CSRF token; only the hash of the value is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrfTokenRecord {
    pub token_hash: String,
    pub session_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfTokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl From<&CsrfToken> for CsrfTokenRecord {
    fn from(token: &CsrfToken) -> Self {
        Self {
            token_hash: hash_token(&token.value),
            session_id: token.session_id.clone(),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
        }
    }
}
