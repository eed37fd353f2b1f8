//! SQLite implementation of the two-factor repository.
//!
//! Active configurations live in `two_factor_configs`, enrollments waiting
//! for their first code in `two_factor_pending`. Replay protection, backup
//! code redemption and activation are each a single conditional statement,
//! so two requests racing with the same code cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{
    Error,
    error::{StorageError, utilities::SerializationResultExt},
    repositories::TwoFactorRepository,
    storage::{StoredBackupCode, StoredTwoFactor},
};
use sqlx::{SqliteConnection, SqlitePool};

use super::{database_error, from_millis, to_millis};

/// SQLite repository for sealed TOTP secrets and backup code digests.
pub struct SqliteTwoFactorRepository {
    pool: SqlitePool,
}

impl SqliteTwoFactorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SqliteTwoFactorConfig {
    account_id: String,
    sealed_secret: String,
    issued_at: i64,
    confirmed_at: Option<i64>,
    last_used_step: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SqliteBackupCode {
    digest: String,
    used_at: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SqlitePendingEnrollment {
    account_id: String,
    sealed_secret: String,
    issued_at: i64,
    /// JSON array of backup code digests.
    backup_digests: String,
}

impl TryFrom<SqlitePendingEnrollment> for StoredTwoFactor {
    type Error = Error;

    fn try_from(row: SqlitePendingEnrollment) -> Result<Self, Self::Error> {
        let digests: Vec<String> =
            serde_json::from_str(&row.backup_digests).map_serialization_err()?;
        Ok(StoredTwoFactor {
            account_id: row.account_id,
            sealed_secret: row.sealed_secret,
            issued_at: from_millis(row.issued_at)?,
            confirmed_at: None,
            last_used_step: None,
            backup_codes: digests
                .into_iter()
                .map(|digest| StoredBackupCode {
                    digest,
                    used_at: None,
                })
                .collect(),
        })
    }
}

fn step_to_db(step: u64) -> Result<i64, Error> {
    i64::try_from(step).map_err(|_| {
        Error::Storage(StorageError::Serialization(format!(
            "time step out of range: {step}"
        )))
    })
}

/// Replace the active configuration and its backup codes.
async fn write_active(conn: &mut SqliteConnection, config: &StoredTwoFactor) -> Result<(), Error> {
    let last_used_step = config.last_used_step.map(step_to_db).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO two_factor_configs (account_id, sealed_secret, issued_at, confirmed_at, last_used_step)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (account_id) DO UPDATE SET
            sealed_secret = excluded.sealed_secret,
            issued_at = excluded.issued_at,
            confirmed_at = excluded.confirmed_at,
            last_used_step = excluded.last_used_step
        "#,
    )
    .bind(&config.account_id)
    .bind(&config.sealed_secret)
    .bind(to_millis(config.issued_at))
    .bind(config.confirmed_at.map(to_millis))
    .bind(last_used_step)
    .execute(&mut *conn)
    .await
    .map_err(database_error("Failed to save two-factor configuration"))?;

    sqlx::query("DELETE FROM two_factor_backup_codes WHERE account_id = ?")
        .bind(&config.account_id)
        .execute(&mut *conn)
        .await
        .map_err(database_error("Failed to replace backup codes"))?;

    for code in &config.backup_codes {
        sqlx::query(
            "INSERT INTO two_factor_backup_codes (account_id, digest, used_at) VALUES (?, ?, ?)",
        )
        .bind(&config.account_id)
        .bind(&code.digest)
        .bind(code.used_at.map(to_millis))
        .execute(&mut *conn)
        .await
        .map_err(database_error("Failed to store backup code"))?;
    }

    Ok(())
}

#[async_trait]
impl TwoFactorRepository for SqliteTwoFactorRepository {
    async fn save_pending(&self, config: StoredTwoFactor) -> Result<StoredTwoFactor, Error> {
        let digests: Vec<&str> = config
            .backup_codes
            .iter()
            .map(|code| code.digest.as_str())
            .collect();
        let digests = serde_json::to_string(&digests).map_serialization_err()?;

        sqlx::query(
            r#"
            INSERT INTO two_factor_pending (account_id, sealed_secret, issued_at, backup_digests)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (account_id) DO UPDATE SET
                sealed_secret = excluded.sealed_secret,
                issued_at = excluded.issued_at,
                backup_digests = excluded.backup_digests
            "#,
        )
        .bind(&config.account_id)
        .bind(&config.sealed_secret)
        .bind(to_millis(config.issued_at))
        .bind(digests)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to save pending two-factor enrollment"))?;

        Ok(config)
    }

    async fn find(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        let Some(row) = sqlx::query_as::<_, SqliteTwoFactorConfig>(
            r#"
            SELECT account_id, sealed_secret, issued_at, confirmed_at, last_used_step
            FROM two_factor_configs
            WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("Failed to find two-factor configuration"))?
        else {
            return Ok(None);
        };

        let codes = sqlx::query_as::<_, SqliteBackupCode>(
            "SELECT digest, used_at FROM two_factor_backup_codes WHERE account_id = ? ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("Failed to load backup codes"))?;

        let backup_codes = codes
            .into_iter()
            .map(|code| {
                Ok(StoredBackupCode {
                    digest: code.digest,
                    used_at: code.used_at.map(from_millis).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Some(StoredTwoFactor {
            account_id: row.account_id,
            sealed_secret: row.sealed_secret,
            issued_at: from_millis(row.issued_at)?,
            confirmed_at: row.confirmed_at.map(from_millis).transpose()?,
            last_used_step: row.last_used_step.and_then(|step| u64::try_from(step).ok()),
            backup_codes,
        }))
    }

    async fn find_pending(&self, account_id: &str) -> Result<Option<StoredTwoFactor>, Error> {
        sqlx::query_as::<_, SqlitePendingEnrollment>(
            r#"
            SELECT account_id, sealed_secret, issued_at, backup_digests
            FROM two_factor_pending
            WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("Failed to find pending two-factor enrollment"))?
        .map(StoredTwoFactor::try_from)
        .transpose()
    }

    async fn activate(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("Failed to begin two-factor transaction"))?;

        // Claiming the pending row is the first write; the transaction holds
        // the write lock from here until commit.
        let Some(row) = sqlx::query_as::<_, SqlitePendingEnrollment>(
            r#"
            DELETE FROM two_factor_pending
            WHERE account_id = ? AND sealed_secret = ?
            RETURNING account_id, sealed_secret, issued_at, backup_digests
            "#,
        )
        .bind(account_id)
        .bind(sealed_secret)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database_error("Failed to claim pending two-factor enrollment"))?
        else {
            return Ok(false);
        };

        let mut config = StoredTwoFactor::try_from(row)?;
        config.confirmed_at = Some(at);
        config.last_used_step = Some(step);
        write_active(&mut *tx, &config).await?;

        tx.commit()
            .await
            .map_err(database_error("Failed to commit two-factor transaction"))?;
        Ok(true)
    }

    async fn consume_step(
        &self,
        account_id: &str,
        sealed_secret: &str,
        step: u64,
    ) -> Result<bool, Error> {
        let step = step_to_db(step)?;
        let result = sqlx::query(
            r#"
            UPDATE two_factor_configs
            SET last_used_step = ?
            WHERE account_id = ?
            AND sealed_secret = ?
            AND (last_used_step IS NULL OR last_used_step < ?)
            "#,
        )
        .bind(step)
        .bind(account_id)
        .bind(sealed_secret)
        .bind(step)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to record TOTP step"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn redeem_backup_code(
        &self,
        account_id: &str,
        digest: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE two_factor_backup_codes
            SET used_at = ?
            WHERE account_id = ? AND digest = ? AND used_at IS NULL
            "#,
        )
        .bind(to_millis(at))
        .bind(account_id)
        .bind(digest)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to redeem backup code"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, account_id: &str) -> Result<bool, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database_error("Failed to begin two-factor transaction"))?;

        sqlx::query("DELETE FROM two_factor_backup_codes WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to delete backup codes"))?;

        let active = sqlx::query("DELETE FROM two_factor_configs WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to delete two-factor configuration"))?;

        let pending = sqlx::query("DELETE FROM two_factor_pending WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(database_error("Failed to delete pending two-factor enrollment"))?;

        tx.commit()
            .await
            .map_err(database_error("Failed to commit two-factor transaction"))?;
        Ok(active.rows_affected() + pending.rows_affected() > 0)
    }
}
