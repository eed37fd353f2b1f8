//! # Rampart
//!
//! Rampart is the security core that sits beside an authentication system. It
//! does not store users or passwords; it decides whether an attempt may go
//! ahead and keeps a record of what looked hostile.
//!
//! - Brute-force and rate-limit tracking with rolling windows and blocks
//! - TOTP two-factor authentication with one-time backup codes
//! - Session-bound CSRF tokens
//! - An input sanitization gate for text that reaches storage or HTML
//! - An append-only security event log
//!
//! ## Storage Support
//!
//! - In-memory, for single instances and tests
//! - SQLite (`sqlite` feature), shared by every process using the database
//!
//! ## Example
//!
//! ```rust,no_run
//! use rampart::{LoginIdentity, RampartBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rampart = RampartBuilder::new()
//!         .with_sqlite("sqlite::memory:")
//!         .await?
//!         .with_secret_key(std::env::var("RAMPART_SECRET_KEY")?)
//!         .apply_migrations(true)
//!         .build()
//!         .await?;
//!
//!     let identity = LoginIdentity::new(Some("203.0.113.7"), "alice@example.com")?;
//!     rampart.check_login(&identity).await?;
//!     // ... verify the password ...
//!     rampart.record_login_failure(&identity).await?;
//!     Ok(())
//! }
//! ```

mod builder;

use std::{net::IpAddr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use rampart_core::{
    crypto::SecretSealer,
    error::{ConfigurationError, RateLimitError, TwoFactorError, ValidationError},
    repositories::{
        AlertRepositoryAdapter, AttemptRepositoryAdapter, CsrfTokenRepositoryAdapter,
        TwoFactorRepositoryAdapter,
    },
    services::{CsrfService, SecurityTracker, TotpEngine, TwoFactorService},
    validation::normalize_email,
};

pub use builder::{NoStorage, RampartBuilder, RampartBuilderError, WithStorage};

/// Re-export core types from rampart_core
pub use rampart_core::{
    AlertFilter, AlertSeverity, AlertType, AttemptDecision, AttemptRecord, Clock, CsrfConfig,
    CsrfToken, Error, Event, EventBus, EventHandler, ManualClock, RampartConfig,
    RepositoryProvider, RuleScope, SanitizeOptions, SecurityAlert, SecurityRule, SystemClock,
    TotpConfig, TwoFactorEnrollment, ValidationResult, error, repositories::InMemoryRepositoryProvider,
    validation,
};

/// Re-export storage backends
#[cfg(feature = "sqlite")]
pub use rampart_storage_sqlite::SqliteRepositoryProvider;

type Tracker<R> = SecurityTracker<AttemptRepositoryAdapter<R>, AlertRepositoryAdapter<R>>;

/// Who is trying to log in.
///
/// The email is normalized through the sanitization gate so that every
/// spelling of an address shares one counter. The address, when known, is
/// stored in its canonical textual form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginIdentity {
    ip: Option<String>,
    email: String,
}

impl LoginIdentity {
    pub fn new(ip: Option<&str>, email: &str) -> Result<Self, Error> {
        let email = normalize_email(email)?;
        let ip = match ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(ip) => Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| ValidationError::InvalidField("ip address".to_string()))?
                    .to_canonical()
                    .to_string(),
            ),
            None => None,
        };
        Ok(Self { ip, email })
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    fn login_checks(&self) -> Vec<(&'static str, &str)> {
        let mut checks = Vec::with_capacity(2);
        if let Some(ip) = &self.ip {
            checks.push((SecurityRule::LOGIN_IP, ip.as_str()));
        }
        checks.push((SecurityRule::LOGIN_EMAIL, self.email.as_str()));
        checks
    }
}

/// The proof presented as a second factor.
#[derive(Clone, PartialEq, Eq)]
pub enum SecondFactor {
    /// A code from the authenticator app.
    Totp(String),
    /// One of the account's one-time recovery codes.
    Backup(String),
}

impl std::fmt::Debug for SecondFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecondFactor::Totp(_) => f.write_str("Totp([REDACTED])"),
            SecondFactor::Backup(_) => f.write_str("Backup([REDACTED])"),
        }
    }
}

/// The security core, wired to one storage backend.
///
/// Construct it with [`RampartBuilder`] and share it behind an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use rampart::{RampartBuilder, SecondFactor, LoginIdentity};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let rampart = RampartBuilder::new()
///     .with_memory()
///     .with_secret_key("<base64 key>")
///     .build()
///     .await?;
///
/// let identity = LoginIdentity::new(None, "alice@example.com")?;
/// rampart
///     .verify_second_factor(&identity, "acct_1", SecondFactor::Totp("123456".into()))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Rampart<R: RepositoryProvider> {
    repositories: Arc<R>,
    tracker: Arc<Tracker<R>>,
    two_factor: Arc<TwoFactorService<TwoFactorRepositoryAdapter<R>>>,
    csrf: Arc<CsrfService<CsrfTokenRepositoryAdapter<R>>>,
    events: EventBus,
    config: RampartConfig,
}

impl<R: RepositoryProvider> Rampart<R> {
    /// Create an instance on the wall clock with an empty event bus.
    ///
    /// # Errors
    ///
    /// Any [`ConfigurationError`]: an invalid rule or parameter, a missing
    /// login rule, or a missing or malformed secret key.
    pub fn new(repositories: Arc<R>, config: RampartConfig) -> Result<Self, ConfigurationError> {
        Self::from_parts(repositories, config, Arc::new(SystemClock), EventBus::new())
    }

    pub(crate) fn from_parts(
        repositories: Arc<R>,
        config: RampartConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        for required in [
            SecurityRule::LOGIN_IP,
            SecurityRule::LOGIN_EMAIL,
            SecurityRule::TWO_FACTOR,
        ] {
            if config.rule(required).is_none() {
                return Err(ConfigurationError::UnknownRule(required.to_string()));
            }
        }

        let key = config
            .secret_key
            .as_deref()
            .ok_or(ConfigurationError::MissingSecretKey)?;
        let sealer = Arc::new(SecretSealer::from_base64(key)?);

        let tracker = Arc::new(SecurityTracker::new(
            Arc::new(AttemptRepositoryAdapter::new(repositories.clone())),
            Arc::new(AlertRepositoryAdapter::new(repositories.clone())),
            config.rules.clone(),
            clock.clone(),
            events.clone(),
        )?);

        let engine = Arc::new(TotpEngine::new(config.totp.clone(), clock.clone())?);
        let two_factor = Arc::new(TwoFactorService::new(
            Arc::new(TwoFactorRepositoryAdapter::new(repositories.clone())),
            engine,
            sealer,
            clock.clone(),
            events.clone(),
        ));

        let csrf = Arc::new(CsrfService::new(
            Arc::new(CsrfTokenRepositoryAdapter::new(repositories.clone())),
            config.csrf.clone(),
            clock,
            events.clone(),
        )?);

        Ok(Self {
            repositories,
            tracker,
            two_factor,
            csrf,
            events,
            config,
        })
    }

    pub fn tracker(&self) -> &Tracker<R> {
        &self.tracker
    }

    pub fn two_factor(&self) -> &TwoFactorService<TwoFactorRepositoryAdapter<R>> {
        &self.two_factor
    }

    pub fn csrf(&self) -> &CsrfService<CsrfTokenRepositoryAdapter<R>> {
        &self.csrf
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &RampartConfig {
        &self.config
    }

    /// Run migrations for all repositories
    pub async fn migrate(&self) -> Result<(), Error> {
        self.repositories.migrate().await
    }

    /// Health check for all repositories
    pub async fn health_check(&self) -> Result<(), Error> {
        self.repositories.health_check().await
    }

    // ------------------------------------------------------------------
    // Login flow
    // ------------------------------------------------------------------

    /// Decide whether a login attempt may proceed.
    ///
    /// Both the address and the account must be under their limits. An
    /// allowed attempt holds a slot until its outcome is reported.
    ///
    /// # Errors
    ///
    /// [`RateLimitError::Exceeded`] when denied. The error does not say
    /// whether the address or the account was refused.
    pub async fn check_login(&self, identity: &LoginIdentity) -> Result<AttemptDecision, Error> {
        let decision = self.tracker.check_all(&identity.login_checks()).await?;
        if !decision.allowed {
            return Err(RateLimitError::Exceeded {
                retry_after_ms: decision.retry_after_ms,
            }
            .into());
        }
        Ok(decision)
    }

    /// Report a failed password check.
    pub async fn record_login_failure(&self, identity: &LoginIdentity) -> Result<(), Error> {
        for (rule_name, key) in identity.login_checks() {
            self.tracker.record_failure(key, rule_name).await?;
        }
        Ok(())
    }

    /// Report a successful login.
    pub async fn record_login_success(&self, identity: &LoginIdentity) -> Result<(), Error> {
        for (rule_name, key) in identity.login_checks() {
            self.tracker.record_success(key, rule_name).await?;
        }
        Ok(())
    }

    /// Verify the second factor of a login that passed the password check.
    ///
    /// Attempts count against the account's `two_factor` rule and, when the
    /// address is known, against `login_ip`.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::Exceeded`] if either rule refuses the attempt
    /// - [`TwoFactorError::InvalidCode`] for a wrong, replayed or used code,
    ///   whichever kind of code was presented
    /// - [`TwoFactorError::NotEnrolled`] if the account has no active
    ///   two-factor configuration
    pub async fn verify_second_factor(
        &self,
        identity: &LoginIdentity,
        account_id: &str,
        factor: SecondFactor,
    ) -> Result<(), Error> {
        let mut checks = vec![(SecurityRule::TWO_FACTOR, account_id)];
        if let Some(ip) = identity.ip() {
            checks.push((SecurityRule::LOGIN_IP, ip));
        }

        let decision = self.tracker.check_all(&checks).await?;
        if !decision.allowed {
            return Err(RateLimitError::Exceeded {
                retry_after_ms: decision.retry_after_ms,
            }
            .into());
        }

        let result = match &factor {
            SecondFactor::Totp(code) => self.two_factor.verify_code(account_id, code).await,
            SecondFactor::Backup(code) => self
                .two_factor
                .verify_backup_code(account_id, code)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                for &(rule_name, key) in &checks {
                    self.tracker.record_success(key, rule_name).await?;
                }
                Ok(())
            }
            Err(Error::TwoFactor(TwoFactorError::InvalidCode)) => {
                for &(rule_name, key) in &checks {
                    self.tracker.record_failure(key, rule_name).await?;
                }
                Err(TwoFactorError::InvalidCode.into())
            }
            Err(e) => {
                for &(rule_name, key) in &checks {
                    if let Err(release) = self.tracker.release_attempt(key, rule_name).await {
                        tracing::warn!(error = %release, rule = %rule_name, "Failed to release attempt slot");
                    }
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Two-factor lifecycle
    // ------------------------------------------------------------------

    pub async fn enroll_two_factor(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        self.two_factor.enroll(account_id, display_name).await
    }

    pub async fn confirm_two_factor(&self, account_id: &str, code: &str) -> Result<(), Error> {
        self.two_factor.confirm(account_id, code).await
    }

    pub async fn regenerate_two_factor(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<TwoFactorEnrollment, Error> {
        self.two_factor.regenerate(account_id, display_name).await
    }

    pub async fn disable_two_factor(&self, account_id: &str) -> Result<bool, Error> {
        self.two_factor.disable(account_id).await
    }

    pub async fn two_factor_enabled(&self, account_id: &str) -> Result<bool, Error> {
        self.two_factor.is_enabled(account_id).await
    }

    pub async fn remaining_backup_codes(&self, account_id: &str) -> Result<usize, Error> {
        self.two_factor.remaining_backup_codes(account_id).await
    }

    // ------------------------------------------------------------------
    // CSRF
    // ------------------------------------------------------------------

    pub async fn issue_csrf_token(&self, session_id: &str) -> Result<CsrfToken, Error> {
        self.csrf.issue(session_id).await
    }

    /// Issue a token that does not outlive its session.
    pub async fn issue_csrf_token_until(
        &self,
        session_id: &str,
        session_expires_at: DateTime<Utc>,
    ) -> Result<CsrfToken, Error> {
        self.csrf.issue_bounded(session_id, session_expires_at).await
    }

    pub async fn validate_csrf_token(&self, session_id: &str, token: &str) -> Result<bool, Error> {
        self.csrf.validate(session_id, token).await
    }

    pub async fn verify_csrf_token(&self, session_id: &str, token: &str) -> Result<(), Error> {
        self.csrf.verify(session_id, token).await
    }

    pub async fn refresh_csrf_token(&self, session_id: &str) -> Result<CsrfToken, Error> {
        self.csrf.refresh(session_id).await
    }

    /// Forget every CSRF token of a session, typically on logout.
    pub async fn end_csrf_session(&self, session_id: &str) -> Result<u64, Error> {
        self.csrf.remove(session_id).await
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    pub async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error> {
        self.tracker.list_alerts(filter).await
    }

    pub async fn resolve_alert(&self, alert_id: &str) -> Result<bool, Error> {
        self.tracker.resolve_alert(alert_id).await
    }

    pub async fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        identity: &str,
        message: &str,
    ) -> Result<SecurityAlert, Error> {
        self.tracker
            .raise_alert(alert_type, severity, identity, message)
            .await
    }

    pub async fn block_identity(
        &self,
        identity_key: &str,
        rule_name: &str,
        duration: Duration,
    ) -> Result<AttemptRecord, Error> {
        self.tracker
            .block_identity(identity_key, rule_name, duration)
            .await
    }

    pub async fn unblock_identity(&self, identity_key: &str, rule_name: &str) -> Result<bool, Error> {
        self.tracker.unblock_identity(identity_key, rule_name).await
    }

    pub fn rules(&self) -> Vec<SecurityRule> {
        self.tracker.rules()
    }

    pub fn set_rule_enabled(&self, rule_name: &str, enabled: bool) -> Result<(), Error> {
        self.tracker.set_rule_enabled(rule_name, enabled)
    }

    pub fn upsert_rule(&self, rule: SecurityRule) -> Result<(), Error> {
        self.tracker.upsert_rule(rule)
    }

    pub async fn attempt_record(
        &self,
        identity_key: &str,
        rule_name: &str,
    ) -> Result<Option<AttemptRecord>, Error> {
        self.tracker.attempt_record(identity_key, rule_name).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict expired attempt records and purge expired CSRF tokens once.
    ///
    /// # Returns
    ///
    /// `(attempt_records, csrf_tokens)` removed.
    pub async fn sweep(&self) -> Result<(u64, u64), Error> {
        let attempts = self.tracker.sweep_expired().await?;
        let tokens = self.csrf.purge_expired().await?;
        Ok((attempts, tokens))
    }

    /// Start the background sweep on the configured interval.
    ///
    /// # Returns
    ///
    /// `None` if `sweep_interval_secs` is `0`.
    pub fn start_sweep_task(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.sweep_interval_secs == 0 {
            return None;
        }
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        let tracker = Arc::clone(&self.tracker);
        let csrf = Arc::clone(&self.csrf);

        Some(tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        match tracker.sweep_expired().await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count = count, "Evicted expired attempt records");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to evict expired attempt records");
                            }
                            _ => {}
                        }
                        if let Err(e) = csrf.purge_expired().await {
                            tracing::warn!(error = %e, "Failed to purge expired CSRF tokens");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down security sweep task");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_identity_normalizes_inputs() {
        let identity = LoginIdentity::new(Some(" 2001:DB8::1 "), "  Alice@Example.COM ").unwrap();
        assert_eq!(identity.ip(), Some("2001:db8::1"));
        assert_eq!(identity.email(), "alice@example.com");

        let mapped = LoginIdentity::new(Some("::ffff:203.0.113.7"), "alice@example.com").unwrap();
        assert_eq!(mapped.ip(), Some("203.0.113.7"));

        let no_ip = LoginIdentity::new(Some(""), "bob@example.com").unwrap();
        assert_eq!(no_ip.ip(), None);
        assert_eq!(no_ip.login_checks().len(), 1);
    }

    #[test]
    fn test_login_identity_rejects_bad_input() {
        assert!(matches!(
            LoginIdentity::new(None, "not-an-email"),
            Err(Error::Validation(ValidationError::InvalidEmail(_)))
        ));
        assert!(matches!(
            LoginIdentity::new(Some("999.1.1.1"), "alice@example.com"),
            Err(Error::Validation(ValidationError::InvalidField(_)))
        ));
    }

    #[test]
    fn test_second_factor_debug_is_redacted() {
        let factor = SecondFactor::Totp("123456".to_string());
        assert_eq!(format!("{factor:?}"), "Totp([REDACTED])");
    }

    #[test]
    fn test_missing_secret_key_is_rejected() {
        let result = Rampart::new(
            Arc::new(InMemoryRepositoryProvider::new()),
            RampartConfig::default(),
        );
        assert!(matches!(result, Err(ConfigurationError::MissingSecretKey)));
    }

    #[test]
    fn test_missing_login_rule_is_rejected() {
        let mut config =
            RampartConfig::default().with_secret_key(SecretSealer::generate_key().unwrap());
        config.rules.retain(|rule| rule.name != SecurityRule::TWO_FACTOR);

        let result = Rampart::new(Arc::new(InMemoryRepositoryProvider::new()), config);
        assert!(matches!(result, Err(ConfigurationError::UnknownRule(name)) if name == "two_factor"));
    }
}
