//! The same flows on the SQLite store
#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use chrono::Duration;
use rampart::{
    Clock, Error, LoginIdentity, ManualClock, Rampart, RampartBuilder, SecondFactor, SecurityRule,
    SqliteRepositoryProvider,
    error::{RateLimitError, TwoFactorError},
};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use common::{START, current_code, one_step, secret_key, wrong_code};

async fn pool() -> SqlitePool {
    // One connection keeps every query on the same in-memory database.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn sqlite_rampart(
    pool: SqlitePool,
    clock: &ManualClock,
    key: &str,
) -> Rampart<SqliteRepositoryProvider> {
    RampartBuilder::new()
        .with_sqlite_pool(pool)
        .with_secret_key(key)
        .with_clock(Arc::new(clock.clone()))
        .apply_migrations(true)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sqlite_email_lockout() {
    let clock = ManualClock::at_unix(START);
    let rampart = sqlite_rampart(pool().await, &clock, &secret_key()).await;
    let identity = LoginIdentity::new(Some("203.0.113.7"), "alice@example.com").unwrap();

    for _ in 0..5 {
        rampart.check_login(&identity).await.unwrap();
        rampart.record_login_failure(&identity).await.unwrap();
    }

    let denied = rampart.check_login(&identity).await.unwrap_err();
    assert!(matches!(
        denied,
        Error::RateLimit(RateLimitError::Exceeded {
            retry_after_ms: 900_000
        })
    ));

    let record = rampart
        .attempt_record("alice@example.com", SecurityRule::LOGIN_EMAIL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.count, 5);
    assert!(record.is_blocked(clock.now()));

    clock.advance(Duration::minutes(15));
    rampart.check_login(&identity).await.unwrap();
}

#[tokio::test]
async fn test_sqlite_second_factor() {
    let clock = ManualClock::at_unix(START);
    let rampart = sqlite_rampart(pool().await, &clock, &secret_key()).await;
    let identity = LoginIdentity::new(None, "alice@example.com").unwrap();

    let enrollment = rampart
        .enroll_two_factor("acct_1", "alice@example.com")
        .await
        .unwrap();
    let secret = enrollment.config.secret.clone();
    rampart
        .confirm_two_factor("acct_1", &current_code(&rampart, &secret))
        .await
        .unwrap();

    clock.advance(one_step());
    let code = current_code(&rampart, &secret);
    rampart
        .verify_second_factor(&identity, "acct_1", SecondFactor::Totp(code.clone()))
        .await
        .unwrap();
    let replay = rampart
        .verify_second_factor(&identity, "acct_1", SecondFactor::Totp(code))
        .await;
    assert!(matches!(
        replay,
        Err(Error::TwoFactor(TwoFactorError::InvalidCode))
    ));

    let wrong = wrong_code(&rampart, &clock, &secret);
    let result = rampart
        .verify_second_factor(&identity, "acct_1", SecondFactor::Totp(wrong))
        .await;
    assert!(matches!(
        result,
        Err(Error::TwoFactor(TwoFactorError::InvalidCode))
    ));

    let backup = enrollment.config.backup_codes[3].code.clone();
    rampart
        .verify_second_factor(&identity, "acct_1", SecondFactor::Backup(backup))
        .await
        .unwrap();
    assert_eq!(rampart.remaining_backup_codes("acct_1").await.unwrap(), 9);

    assert!(rampart.disable_two_factor("acct_1").await.unwrap());
    assert!(!rampart.two_factor_enabled("acct_1").await.unwrap());
}

#[tokio::test]
async fn test_sqlite_regeneration_swaps_on_confirm() {
    let clock = ManualClock::at_unix(START);
    let rampart = sqlite_rampart(pool().await, &clock, &secret_key()).await;
    let identity = LoginIdentity::new(None, "erin@example.com").unwrap();

    let original = rampart
        .enroll_two_factor("acct_3", "erin@example.com")
        .await
        .unwrap();
    rampart
        .confirm_two_factor("acct_3", &current_code(&rampart, &original.config.secret))
        .await
        .unwrap();

    let regenerated = rampart
        .regenerate_two_factor("acct_3", "erin@example.com")
        .await
        .unwrap();
    assert!(rampart.two_factor_enabled("acct_3").await.unwrap());

    clock.advance(one_step());
    rampart
        .verify_second_factor(
            &identity,
            "acct_3",
            SecondFactor::Totp(current_code(&rampart, &original.config.secret)),
        )
        .await
        .unwrap();

    clock.advance(one_step());
    rampart
        .confirm_two_factor(
            "acct_3",
            &current_code(&rampart, &regenerated.config.secret),
        )
        .await
        .unwrap();
    assert_eq!(rampart.remaining_backup_codes("acct_3").await.unwrap(), 10);

    let backup = regenerated.config.backup_codes[0].code.clone();
    rampart
        .verify_second_factor(&identity, "acct_3", SecondFactor::Backup(backup))
        .await
        .unwrap();
    assert_eq!(rampart.remaining_backup_codes("acct_3").await.unwrap(), 9);
}

#[tokio::test]
async fn test_instances_sharing_a_database_share_blocks() {
    let pool = pool().await;
    let clock = ManualClock::at_unix(START);
    let key = secret_key();
    let first = sqlite_rampart(pool.clone(), &clock, &key).await;
    let second = sqlite_rampart(pool, &clock, &key).await;

    first
        .block_identity("198.51.100.9", SecurityRule::LOGIN_IP, Duration::hours(1))
        .await
        .unwrap();

    let identity = LoginIdentity::new(Some("198.51.100.9"), "carol@example.com").unwrap();
    let denied = second.check_login(&identity).await.unwrap_err();
    assert_eq!(denied.retry_after_ms(), Some(3_600_000));

    // A second-factor secret sealed by one instance opens in the other.
    let enrollment = first
        .enroll_two_factor("acct_7", "carol@example.com")
        .await
        .unwrap();
    second
        .confirm_two_factor(
            "acct_7",
            &current_code(&second, &enrollment.config.secret),
        )
        .await
        .unwrap();
    assert!(first.two_factor_enabled("acct_7").await.unwrap());
}

#[tokio::test]
async fn test_sqlite_sweep_removes_stale_state() {
    let clock = ManualClock::at_unix(START);
    let rampart = sqlite_rampart(pool().await, &clock, &secret_key()).await;
    let identity = LoginIdentity::new(Some("203.0.113.7"), "dave@example.com").unwrap();

    rampart.check_login(&identity).await.unwrap();
    rampart.record_login_failure(&identity).await.unwrap();
    rampart.issue_csrf_token("sess_1").await.unwrap();

    clock.advance(Duration::days(1));
    let (attempts, tokens) = rampart.sweep().await.unwrap();
    assert_eq!(attempts, 2);
    assert_eq!(tokens, 1);
    assert!(
        rampart
            .attempt_record("dave@example.com", SecurityRule::LOGIN_EMAIL)
            .await
            .unwrap()
            .is_none()
    );
}
