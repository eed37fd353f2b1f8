//! Concurrent attempts must not get past a limit together

mod common;

use std::sync::Arc;

use rampart::{LoginIdentity, SecurityRule};

use common::memory_rampart;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_respect_account_limit() {
    let (rampart, _clock) = memory_rampart().await;
    let rampart = Arc::new(rampart);
    let identity = Arc::new(LoginIdentity::new(None, "alice@example.com").unwrap());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let rampart = Arc::clone(&rampart);
        let identity = Arc::clone(&identity);
        handles.push(tokio::spawn(async move {
            rampart.check_login(&identity).await.is_ok()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);

    let record = rampart
        .attempt_record("alice@example.com", SecurityRule::LOGIN_EMAIL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.pending.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_block_once() {
    let (rampart, _clock) = memory_rampart().await;
    let rampart = Arc::new(rampart);
    let identity = Arc::new(LoginIdentity::new(None, "bob@example.com").unwrap());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let rampart = Arc::clone(&rampart);
        let identity = Arc::clone(&identity);
        handles.push(tokio::spawn(async move {
            if rampart.check_login(&identity).await.is_ok() {
                rampart.record_login_failure(&identity).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let blocked = rampart
        .list_alerts(&rampart::AlertFilter {
            alert_type: Some(rampart::AlertType::EmailBlocked),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(rampart.check_login(&identity).await.is_err());
}
