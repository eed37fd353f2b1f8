//! SQLite implementation of the attempt repository.
//!
//! Each transition runs in one transaction whose first statement is a write.
//! SQLite takes the database write lock at that statement, so the read and
//! update that follow cannot interleave with another writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{
    Error,
    error::{StorageError, utilities::SerializationResultExt},
    repositories::AttemptRepository,
    storage::{AttemptDecision, AttemptRecord, FailureOutcome, SecurityRule},
};
use sqlx::{SqliteConnection, SqlitePool};

use super::{database_error, to_millis};

/// SQLite repository for per-identity attempt records.
pub struct SqliteAttemptRepository {
    pool: SqlitePool,
}

impl SqliteAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the record, apply `apply` and write it back in one transaction.
    ///
    /// With `create` a missing record starts out empty; without it the
    /// transition is skipped and `None` returned.
    async fn transition<T, F>(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
        create: bool,
        apply: F,
    ) -> Result<Option<T>, Error>
    where
        F: FnOnce(&mut AttemptRecord) -> T + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("Failed to begin attempt transaction"))?;

        if create {
            let fresh = AttemptRecord::new(key, &rule.name, now);
            let json = serde_json::to_string(&fresh).map_serialization_err()?;
            sqlx::query(
                r#"
                INSERT INTO attempt_records (rule_name, identity_key, record, expires_at, blocked_until)
                VALUES (?, ?, ?, ?, NULL)
                ON CONFLICT (rule_name, identity_key) DO NOTHING
                "#,
            )
            .bind(&rule.name)
            .bind(key)
            .bind(json)
            .bind(to_millis(fresh.expires_at))
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to create attempt record"))?;
        } else {
            // A no-op write, only to take the write lock before reading.
            sqlx::query(
                "UPDATE attempt_records SET expires_at = expires_at WHERE rule_name = ? AND identity_key = ?",
            )
            .bind(&rule.name)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to lock attempt record"))?;
        }

        let Some(mut record) = load(&mut *tx, &rule.name, key).await? else {
            tx.commit()
                .await
                .map_err(database_error("Failed to commit attempt transaction"))?;
            return Ok(None);
        };

        let output = apply(&mut record);
        store(&mut *tx, &record).await?;

        tx.commit()
            .await
            .map_err(database_error("Failed to commit attempt transaction"))?;
        Ok(Some(output))
    }
}

async fn load(
    conn: &mut SqliteConnection,
    rule_name: &str,
    key: &str,
) -> Result<Option<AttemptRecord>, Error> {
    let json: Option<String> = sqlx::query_scalar(
        "SELECT record FROM attempt_records WHERE rule_name = ? AND identity_key = ?",
    )
    .bind(rule_name)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(database_error("Failed to load attempt record"))?;

    json.map(|json| serde_json::from_str(&json).map_serialization_err())
        .transpose()
}

async fn store(conn: &mut SqliteConnection, record: &AttemptRecord) -> Result<(), Error> {
    let json = serde_json::to_string(record).map_serialization_err()?;
    sqlx::query(
        r#"
        UPDATE attempt_records
        SET record = ?, expires_at = ?, blocked_until = ?
        WHERE rule_name = ? AND identity_key = ?
        "#,
    )
    .bind(json)
    .bind(to_millis(record.expires_at))
    .bind(record.blocked_until.map(to_millis))
    .bind(&record.rule_name)
    .bind(&record.identity_key)
    .execute(&mut *conn)
    .await
    .map_err(database_error("Failed to store attempt record"))?;
    Ok(())
}

#[async_trait]
impl AttemptRepository for SqliteAttemptRepository {
    async fn reserve(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptDecision, Error> {
        self.transition(rule, key, now, true, |record| record.reserve(rule, now))
            .await?
            .ok_or_else(missing_after_insert)
    }

    async fn record_failure(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, Error> {
        self.transition(rule, key, now, true, |record| {
            record.register_failure(rule, now)
        })
        .await?
        .ok_or_else(missing_after_insert)
    }

    async fn release(
        &self,
        rule: &SecurityRule,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.transition(rule, key, now, false, |record| record.release(rule, now))
            .await?;
        Ok(())
    }

    async fn block(
        &self,
        rule: &SecurityRule,
        key: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AttemptRecord, Error> {
        self.transition(rule, key, now, true, |record| {
            record.block_until(rule, until, now);
            record.clone()
        })
        .await?
        .ok_or_else(missing_after_insert)
    }

    async fn clear(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        let json: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM attempt_records
            WHERE rule_name = ? AND identity_key = ?
            RETURNING record
            "#,
        )
        .bind(rule_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("Failed to clear attempt record"))?;

        json.map(|json| serde_json::from_str(&json).map_serialization_err())
            .transpose()
    }

    async fn find(&self, rule_name: &str, key: &str) -> Result<Option<AttemptRecord>, Error> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(database_error("Failed to acquire connection"))?;
        load(&mut *conn, rule_name, key).await
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let now = to_millis(now);
        let result = sqlx::query(
            r#"
            DELETE FROM attempt_records
            WHERE expires_at <= ?
            AND (blocked_until IS NULL OR blocked_until <= ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to evict expired attempt records"))?;

        Ok(result.rows_affected())
    }
}

fn missing_after_insert() -> Error {
    Error::Storage(StorageError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support;
    use chrono::Duration;
    use rampart_core::storage::RuleScope;

    fn rule(max_attempts: u32) -> SecurityRule {
        SecurityRule::new("login_ip", RuleScope::Ip, max_attempts, 60_000, 300_000)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_holds_slots_until_limit() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        let rule = rule(3);
        let now = at(1_700_000_000);

        for expected_remaining in [2, 1, 0] {
            let decision = repo.reserve(&rule, "10.0.0.1", now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = repo.reserve(&rule, "10.0.0.1", now).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0);

        let record = repo.find("login_ip", "10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.pending.len(), 3);
        assert_eq!(record.count, 0);
    }

    #[tokio::test]
    async fn test_failures_block_and_persist() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        let rule = rule(2);
        let now = at(1_700_000_000);

        let first = repo.record_failure(&rule, "10.0.0.1", now).await.unwrap();
        assert!(!first.newly_blocked);
        let second = repo.record_failure(&rule, "10.0.0.1", now).await.unwrap();
        assert!(second.newly_blocked);

        let record = repo.find("login_ip", "10.0.0.1").await.unwrap().unwrap();
        assert!(record.is_blocked(now));
        assert_eq!(record.blocked_until, Some(now + Duration::minutes(5)));

        let decision = repo.reserve(&rule, "10.0.0.1", now).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, 300_000);
    }

    #[tokio::test]
    async fn test_release_without_record_is_noop() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        repo.release(&rule(3), "10.0.0.1", at(1_700_000_000))
            .await
            .unwrap();
        assert!(repo.find("login_ip", "10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_returns_removed_record() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        let rule = rule(3);
        repo.record_failure(&rule, "10.0.0.1", at(1_700_000_000))
            .await
            .unwrap();

        let removed = repo.clear("login_ip", "10.0.0.1").await.unwrap().unwrap();
        assert_eq!(removed.count, 1);
        assert!(repo.clear("login_ip", "10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_expired_keeps_blocked_records() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        let rule = rule(3);
        let now = at(1_700_000_000);

        repo.record_failure(&rule, "10.0.0.1", now).await.unwrap();
        repo.block(&rule, "10.0.0.2", now + Duration::days(1), now)
            .await
            .unwrap();

        let evicted = repo.evict_expired(now + Duration::hours(1)).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(repo.find("login_ip", "10.0.0.1").await.unwrap().is_none());
        assert!(repo.find("login_ip", "10.0.0.2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rules_are_namespaced() {
        let repo = SqliteAttemptRepository::new(test_support::pool().await);
        let ip_rule = rule(3);
        let other = SecurityRule::new("admin_action", RuleScope::Ip, 3, 60_000, 300_000);
        let now = at(1_700_000_000);

        repo.record_failure(&ip_rule, "10.0.0.1", now).await.unwrap();
        assert!(repo.find("admin_action", "10.0.0.1").await.unwrap().is_none());
        repo.reserve(&other, "10.0.0.1", now).await.unwrap();
        assert_eq!(
            repo.find("login_ip", "10.0.0.1").await.unwrap().unwrap().count,
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_never_exceed_limit() {
        let repo = std::sync::Arc::new(SqliteAttemptRepository::new(test_support::pool().await));
        let rule = std::sync::Arc::new(rule(5));
        let now = at(1_700_000_000);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let repo = repo.clone();
                let rule = rule.clone();
                tokio::spawn(async move { repo.reserve(&rule, "10.0.0.1", now).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_support::file_pool(&dir.path().join("attempts.db"), 8).await;
        let repo = std::sync::Arc::new(SqliteAttemptRepository::new(pool.clone()));
        let rule = std::sync::Arc::new(rule(5));
        let now = at(1_700_000_000);

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let repo = repo.clone();
                let rule = rule.clone();
                tokio::spawn(async move { repo.reserve(&rule, "10.0.0.1", now).await })
            })
            .collect();

        let mut allowed = 0;
        let mut errors = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(decision) if decision.allowed => allowed += 1,
                Ok(_) => {}
                Err(_) => errors += 1,
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(errors, 0);

        let record = repo.find("login_ip", "10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.pending.len(), 5);
        pool.close().await;
    }
}
