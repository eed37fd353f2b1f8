//! CSRF token issuance and validation.
//!
//! Tokens are 256-bit random values bound to one session. Only their SHA256
//! hashes are stored, and a presented token is compared against every stored
//! hash of its session in constant time.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    Error,
    clock::Clock,
    config::CsrfConfig,
    crypto::{constant_time_compare, generate_secure_token, hash_token},
    error::{ConfigurationError, CsrfError},
    events::{Event, EventBus},
    repositories::CsrfTokenRepository,
    storage::{CsrfToken, CsrfTokenRecord},
};

const MAX_SESSION_ID_LENGTH: usize = 256;

pub struct CsrfService<C: CsrfTokenRepository> {
    repository: Arc<C>,
    config: CsrfConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<C: CsrfTokenRepository> CsrfService<C> {
    pub fn new(
        repository: Arc<C>,
        config: CsrfConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            repository,
            config,
            clock,
            events,
        })
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Issue a token for a session.
    ///
    /// With `max_tokens_per_session = 1` every earlier token of the session
    /// stops validating.
    pub async fn issue(&self, session_id: &str) -> Result<CsrfToken, Error> {
        let now = self.clock.now();
        self.issue_until(session_id, now + self.ttl(), now).await
    }

    /// Issue a token that expires no later than the session it belongs to.
    pub async fn issue_bounded(
        &self,
        session_id: &str,
        session_expires_at: DateTime<Utc>,
    ) -> Result<CsrfToken, Error> {
        let now = self.clock.now();
        if session_expires_at <= now {
            return Err(CsrfError::InvalidSession.into());
        }
        self.issue_until(session_id, session_expires_at.min(now + self.ttl()), now)
            .await
    }

    async fn issue_until(
        &self,
        session_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CsrfToken, Error> {
        check_session_id(session_id)?;

        let token = CsrfToken {
            value: generate_secure_token()?,
            session_id: session_id.to_string(),
            issued_at: now,
            expires_at,
        };
        self.repository
            .store(
                CsrfTokenRecord::from(&token),
                self.config.max_tokens_per_session,
                now,
            )
            .await?;

        tracing::debug!(expires_at = %expires_at, "CSRF token issued");
        Ok(token)
    }

    /// `true` if `token` is a live token of `session_id`.
    ///
    /// # Errors
    ///
    /// Only storage failures. A rejected token is `Ok(false)`.
    pub async fn validate(&self, session_id: &str, token: &str) -> Result<bool, Error> {
        match self.verify(session_id, token).await {
            Ok(()) => Ok(true),
            Err(Error::Csrf(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check a presented token against the session's stored tokens.
    ///
    /// # Errors
    ///
    /// - [`CsrfError::MissingToken`] if no token was presented
    /// - [`CsrfError::InvalidSession`] if the session identifier is unusable
    /// - [`CsrfError::TokenExpired`] if the token matched but has expired
    /// - [`CsrfError::TokenMismatch`] otherwise
    pub async fn verify(&self, session_id: &str, token: &str) -> Result<(), Error> {
        let result = self.check(session_id, token).await;
        if let Err(Error::Csrf(reason)) = &result {
            tracing::warn!(reason = %reason, "CSRF token rejected");
            self.events
                .publish(Event::CsrfRejected {
                    session_id: session_id.to_string(),
                    timestamp: self.clock.now(),
                })
                .await;
        }
        result
    }

    async fn check(&self, session_id: &str, token: &str) -> Result<(), Error> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CsrfError::MissingToken.into());
        }
        check_session_id(session_id)?;

        let presented = hash_token(token);
        let records = self.repository.find_by_session(session_id).await?;
        let now = self.clock.now();

        let mut matched: Option<&CsrfTokenRecord> = None;
        for record in &records {
            let ok = constant_time_compare(record.token_hash.as_bytes(), presented.as_bytes());
            if ok && matched.is_none() {
                matched = Some(record);
            }
        }

        match matched {
            Some(record) if record.is_expired(now) => Err(CsrfError::TokenExpired.into()),
            Some(_) => Ok(()),
            None => Err(CsrfError::TokenMismatch.into()),
        }
    }

    /// Invalidate every token of the session and issue a new one.
    pub async fn refresh(&self, session_id: &str) -> Result<CsrfToken, Error> {
        check_session_id(session_id)?;
        self.repository.delete_session(session_id).await?;
        self.issue(session_id).await
    }

    /// Forget every token of a session, typically on logout.
    pub async fn remove(&self, session_id: &str) -> Result<u64, Error> {
        self.repository.delete_session(session_id).await
    }

    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let purged = self.repository.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            tracing::info!(count = purged, "Purged expired CSRF tokens");
        }
        Ok(purged)
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.config.token_ttl_secs).unwrap_or(i64::MAX))
    }
}

fn check_session_id(session_id: &str) -> Result<(), CsrfError> {
    if session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LENGTH
        || session_id.chars().any(|c| c.is_control() || c.is_whitespace())
    {
        return Err(CsrfError::InvalidSession);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, repositories::memory::InMemoryCsrfTokenRepository};

    fn service(config: CsrfConfig) -> (CsrfService<InMemoryCsrfTokenRepository>, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let service = CsrfService::new(
            Arc::new(InMemoryCsrfTokenRepository::default()),
            config,
            Arc::new(clock.clone()),
            EventBus::default(),
        )
        .unwrap();
        (service, clock)
    }

    #[tokio::test]
    async fn test_token_is_bound_to_session() {
        let (service, _) = service(CsrfConfig::default());
        let token = service.issue("sess_a").await.unwrap();

        assert_eq!(token.value.len(), 43);
        assert!(service.validate("sess_a", &token.value).await.unwrap());
        assert!(!service.validate("sess_b", &token.value).await.unwrap());
        assert!(matches!(
            service.verify("sess_b", &token.value).await,
            Err(Error::Csrf(CsrfError::TokenMismatch))
        ));
    }

    #[tokio::test]
    async fn test_token_expires() {
        let (service, clock) = service(CsrfConfig::default());
        let token = service.issue("sess_a").await.unwrap();

        clock.advance(Duration::seconds(3599));
        assert!(service.validate("sess_a", &token.value).await.unwrap());

        clock.advance(Duration::seconds(1));
        assert!(matches!(
            service.verify("sess_a", &token.value).await,
            Err(Error::Csrf(CsrfError::TokenExpired))
        ));
    }

    #[tokio::test]
    async fn test_removed_session_invalidates_tokens() {
        let (service, _) = service(CsrfConfig::default());
        let token = service.issue("sess_a").await.unwrap();
        assert_eq!(service.remove("sess_a").await.unwrap(), 1);
        assert!(!service.validate("sess_a", &token.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_reissue_invalidates_previous_in_single_token_mode() {
        let (service, _) = service(CsrfConfig::default());
        let first = service.issue("sess_a").await.unwrap();
        let second = service.issue("sess_a").await.unwrap();

        assert!(!service.validate("sess_a", &first.value).await.unwrap());
        assert!(service.validate("sess_a", &second.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_token_mode_keeps_recent_tokens() {
        let (service, _) = service(CsrfConfig {
            max_tokens_per_session: 2,
            ..Default::default()
        });
        let first = service.issue("sess_a").await.unwrap();
        let second = service.issue("sess_a").await.unwrap();
        assert!(service.validate("sess_a", &first.value).await.unwrap());
        assert!(service.validate("sess_a", &second.value).await.unwrap());

        let third = service.issue("sess_a").await.unwrap();
        assert!(!service.validate("sess_a", &first.value).await.unwrap());
        assert!(service.validate("sess_a", &third.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_replaces_all_tokens() {
        let (service, _) = service(CsrfConfig {
            max_tokens_per_session: 4,
            ..Default::default()
        });
        let first = service.issue("sess_a").await.unwrap();
        let refreshed = service.refresh("sess_a").await.unwrap();
        assert!(!service.validate("sess_a", &first.value).await.unwrap());
        assert!(service.validate("sess_a", &refreshed.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_issue_bounded_by_session_expiry() {
        let (service, clock) = service(CsrfConfig::default());
        let session_end = clock.now() + Duration::minutes(10);
        let token = service.issue_bounded("sess_a", session_end).await.unwrap();
        assert_eq!(token.expires_at, session_end);

        assert!(matches!(
            service.issue_bounded("sess_a", clock.now()).await,
            Err(Error::Csrf(CsrfError::InvalidSession))
        ));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_input() {
        let (service, _) = service(CsrfConfig::default());
        assert!(matches!(
            service.verify("sess_a", "  ").await,
            Err(Error::Csrf(CsrfError::MissingToken))
        ));
        assert!(matches!(
            service.verify("", "token").await,
            Err(Error::Csrf(CsrfError::InvalidSession))
        ));
        assert!(service.issue("bad session").await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (service, clock) = service(CsrfConfig::default());
        service.issue("sess_a").await.unwrap();
        service.issue("sess_b").await.unwrap();
        assert_eq!(service.purge_expired().await.unwrap(), 0);

        clock.advance(Duration::hours(1));
        assert_eq!(service.purge_expired().await.unwrap(), 2);
    }
}
