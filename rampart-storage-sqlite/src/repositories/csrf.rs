//! SQLite implementation of the CSRF token repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{Error, repositories::CsrfTokenRepository, storage::CsrfTokenRecord};
use sqlx::SqlitePool;

use super::{database_error, from_millis, to_millis};

/// SQLite repository for CSRF token hashes.
pub struct SqliteCsrfTokenRepository {
    pool: SqlitePool,
}

impl SqliteCsrfTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SqliteCsrfToken {
    token_hash: String,
    session_id: String,
    issued_at: i64,
    expires_at: i64,
}

impl TryFrom<SqliteCsrfToken> for CsrfTokenRecord {
    type Error = Error;

    fn try_from(row: SqliteCsrfToken) -> Result<Self, Self::Error> {
        Ok(CsrfTokenRecord {
            token_hash: row.token_hash,
            session_id: row.session_id,
            issued_at: from_millis(row.issued_at)?,
            expires_at: from_millis(row.expires_at)?,
        })
    }
}

#[async_trait]
impl CsrfTokenRepository for SqliteCsrfTokenRepository {
    async fn store(
        &self,
        record: CsrfTokenRecord,
        max_live: usize,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("Failed to begin CSRF transaction"))?;

        sqlx::query("DELETE FROM csrf_tokens WHERE session_id = ? AND expires_at <= ?")
            .bind(&record.session_id)
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to drop expired CSRF tokens"))?;

        sqlx::query(
            "INSERT INTO csrf_tokens (token_hash, session_id, issued_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.token_hash)
        .bind(&record.session_id)
        .bind(to_millis(record.issued_at))
        .bind(to_millis(record.expires_at))
        .execute(&mut *tx)
        .await
        .map_err(database_error("Failed to store CSRF token"))?;

        // Keep the newest `max_live` tokens of the session.
        sqlx::query(
            r#"
            DELETE FROM csrf_tokens
            WHERE session_id = ?
            AND seq NOT IN (
                SELECT seq FROM csrf_tokens
                WHERE session_id = ?
                ORDER BY seq DESC
                LIMIT ?
            )
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.session_id)
        .bind(i64::try_from(max_live.max(1)).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(database_error("Failed to evict old CSRF tokens"))?;

        tx.commit()
            .await
            .map_err(database_error("Failed to commit CSRF transaction"))?;
        Ok(())
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<CsrfTokenRecord>, Error> {
        let rows = sqlx::query_as::<_, SqliteCsrfToken>(
            r#"
            SELECT token_hash, session_id, issued_at, expires_at
            FROM csrf_tokens
            WHERE session_id = ?
            ORDER BY seq
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("Failed to load CSRF tokens"))?;

        rows.into_iter().map(CsrfTokenRecord::try_from).collect()
    }

    async fn delete_session(&self, session_id: &str) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM csrf_tokens WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(database_error("Failed to delete CSRF tokens"))?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM csrf_tokens WHERE expires_at <= ?")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(database_error("Failed to purge expired CSRF tokens"))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support;
    use chrono::Duration;

    fn record(hash: &str, session: &str, issued_at: DateTime<Utc>) -> CsrfTokenRecord {
        CsrfTokenRecord {
            token_hash: hash.to_string(),
            session_id: session.to_string(),
            issued_at,
            expires_at: issued_at + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_store_evicts_oldest_beyond_limit() {
        let repo = SqliteCsrfTokenRepository::new(test_support::pool().await);
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        repo.store(record("h1", "sess_a", now), 2, now).await.unwrap();
        repo.store(record("h2", "sess_a", now), 2, now).await.unwrap();
        repo.store(record("h3", "sess_a", now), 2, now).await.unwrap();
        repo.store(record("other", "sess_b", now), 2, now)
            .await
            .unwrap();

        let hashes: Vec<_> = repo
            .find_by_session("sess_a")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.token_hash)
            .collect();
        assert_eq!(hashes, vec!["h2".to_string(), "h3".to_string()]);
        assert_eq!(repo.find_by_session("sess_b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let repo = SqliteCsrfTokenRepository::new(test_support::pool().await);
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        repo.store(record("h1", "sess_a", now), 4, now).await.unwrap();
        repo.store(record("h2", "sess_a", now), 4, now).await.unwrap();
        repo.store(record("h3", "sess_b", now), 4, now).await.unwrap();

        assert_eq!(repo.delete_session("sess_a").await.unwrap(), 2);
        assert_eq!(repo.purge_expired(now).await.unwrap(), 0);
        assert_eq!(
            repo.purge_expired(now + Duration::hours(1)).await.unwrap(),
            1
        );
        assert!(repo.find_by_session("sess_b").await.unwrap().is_empty());
    }
}
