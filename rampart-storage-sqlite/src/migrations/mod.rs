//! Schema migrations for the SQLite backend.
//!
//! Each migration runs in its own transaction together with the insert into
//! the bookkeeping table, so a failed migration leaves no trace.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

pub const MIGRATION_TABLE: &str = "_rampart_migrations";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Migration: Send + Sync {
    /// Strictly increasing across the migration list.
    fn version(&self) -> i64;

    fn name(&self) -> &str;

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError>;

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: i64,
}

/// Every migration of the schema, in order.
pub fn all() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateAttemptRecordsTable),
        Box::new(CreateSecurityAlertsTable),
        Box::new(CreateCsrfTokensTable),
        Box::new(CreateTwoFactorTables),
        Box::new(CreateIndexes),
        Box::new(CreateTwoFactorPendingTable),
    ]
}

pub struct SqliteMigrationManager {
    pool: SqlitePool,
}

impl SqliteMigrationManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<(), MigrationError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {MIGRATION_TABLE} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL DEFAULT (unixepoch())
            );"#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn up(&self, migrations: &[Box<dyn Migration>]) -> Result<(), MigrationError> {
        check_order(migrations)?;

        for migration in migrations {
            if self.is_applied(migration.version()).await? {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applying migration"
            );

            migration.up(&mut *tx).await?;

            sqlx::query(&format!(
                "INSERT INTO {MIGRATION_TABLE} (version, name, applied_at) VALUES (?, ?, ?)"
            ))
            .bind(migration.version())
            .bind(migration.name())
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    /// Roll back the given migrations, newest first.
    pub async fn down(&self, migrations: &[Box<dyn Migration>]) -> Result<(), MigrationError> {
        for migration in migrations.iter().rev() {
            if !self.is_applied(migration.version()).await? {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Rolling back migration"
            );

            migration.down(&mut *tx).await?;

            sqlx::query(&format!("DELETE FROM {MIGRATION_TABLE} WHERE version = ?"))
                .bind(migration.version())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let records = sqlx::query_as::<_, MigrationRecord>(&format!(
            "SELECT version, name, applied_at FROM {MIGRATION_TABLE} ORDER BY version"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn is_applied(&self, version: i64) -> Result<bool, MigrationError> {
        let applied: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {MIGRATION_TABLE} WHERE version = ?)"
        ))
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(applied)
    }
}

fn check_order(migrations: &[Box<dyn Migration>]) -> Result<(), MigrationError> {
    for pair in migrations.windows(2) {
        if pair[1].version() <= pair[0].version() {
            return Err(MigrationError::Migration(format!(
                "migration {} ({}) is out of order",
                pair[1].name(),
                pair[1].version()
            )));
        }
    }
    Ok(())
}

async fn execute_all(
    conn: &mut SqliteConnection,
    statements: &[&str],
) -> Result<(), MigrationError> {
    for statement in statements {
        sqlx::query(*statement).execute(&mut *conn).await?;
    }
    Ok(())
}

pub struct CreateAttemptRecordsTable;

#[async_trait]
impl Migration for CreateAttemptRecordsTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &str {
        "CreateAttemptRecordsTable"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        // The full record is kept as JSON; the two timestamp columns exist so
        // eviction can run as a single DELETE.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_records (
                rule_name TEXT NOT NULL,
                identity_key TEXT NOT NULL,
                record TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                blocked_until INTEGER,
                PRIMARY KEY (rule_name, identity_key)
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS attempt_records")
            .execute(conn)
            .await?;
        Ok(())
    }
}

pub struct CreateSecurityAlertsTable;

#[async_trait]
impl Migration for CreateSecurityAlertsTable {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &str {
        "CreateSecurityAlertsTable"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS security_alerts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                alert_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                severity_rank INTEGER NOT NULL,
                identity TEXT NOT NULL,
                rule_name TEXT,
                message TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at INTEGER
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS security_alerts")
            .execute(conn)
            .await?;
        Ok(())
    }
}

pub struct CreateCsrfTokensTable;

#[async_trait]
impl Migration for CreateCsrfTokensTable {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &str {
        "CreateCsrfTokensTable"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS csrf_tokens (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT NOT NULL,
                session_id TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS csrf_tokens")
            .execute(conn)
            .await?;
        Ok(())
    }
}

pub struct CreateTwoFactorTables;

#[async_trait]
impl Migration for CreateTwoFactorTables {
    fn version(&self) -> i64 {
        4
    }

    fn name(&self) -> &str {
        "CreateTwoFactorTables"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        execute_all(
            conn,
            &[
                r#"
                CREATE TABLE IF NOT EXISTS two_factor_configs (
                    account_id TEXT PRIMARY KEY,
                    sealed_secret TEXT NOT NULL,
                    issued_at INTEGER NOT NULL,
                    confirmed_at INTEGER,
                    last_used_step INTEGER
                );"#,
                r#"
                CREATE TABLE IF NOT EXISTS two_factor_backup_codes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    account_id TEXT NOT NULL,
                    digest TEXT NOT NULL,
                    used_at INTEGER,
                    FOREIGN KEY (account_id) REFERENCES two_factor_configs(account_id) ON DELETE CASCADE,
                    UNIQUE (account_id, digest)
                );"#,
            ],
        )
        .await
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        execute_all(
            conn,
            &[
                "DROP TABLE IF EXISTS two_factor_backup_codes",
                "DROP TABLE IF EXISTS two_factor_configs",
            ],
        )
        .await
    }
}

pub struct CreateIndexes;

#[async_trait]
impl Migration for CreateIndexes {
    fn version(&self) -> i64 {
        5
    }

    fn name(&self) -> &str {
        "CreateIndexes"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        execute_all(
            conn,
            &[
                "CREATE INDEX IF NOT EXISTS idx_attempt_records_expires_at ON attempt_records(expires_at)",
                "CREATE INDEX IF NOT EXISTS idx_security_alerts_timestamp ON security_alerts(timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_security_alerts_identity ON security_alerts(identity)",
                "CREATE INDEX IF NOT EXISTS idx_csrf_tokens_session_id ON csrf_tokens(session_id)",
                "CREATE INDEX IF NOT EXISTS idx_csrf_tokens_expires_at ON csrf_tokens(expires_at)",
            ],
        )
        .await
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        execute_all(
            conn,
            &[
                "DROP INDEX IF EXISTS idx_attempt_records_expires_at",
                "DROP INDEX IF EXISTS idx_security_alerts_timestamp",
                "DROP INDEX IF EXISTS idx_security_alerts_identity",
                "DROP INDEX IF EXISTS idx_csrf_tokens_session_id",
                "DROP INDEX IF EXISTS idx_csrf_tokens_expires_at",
            ],
        )
        .await
    }
}

/// Enrollments waiting for their first code. They live apart from
/// `two_factor_configs` so a regeneration never disturbs the active secret.
pub struct CreateTwoFactorPendingTable;

#[async_trait]
impl Migration for CreateTwoFactorPendingTable {
    fn version(&self) -> i64 {
        6
    }

    fn name(&self) -> &str {
        "CreateTwoFactorPendingTable"
    }

    async fn up<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS two_factor_pending (
                account_id TEXT PRIMARY KEY,
                sealed_secret TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                backup_digests TEXT NOT NULL
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(&'a self, conn: &'a mut SqliteConnection) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS two_factor_pending")
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> SqliteMigrationManager {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let manager = SqliteMigrationManager::new(pool);
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let manager = manager().await;
        manager.up(&all()).await.unwrap();
        manager.up(&all()).await.unwrap();

        let applied = manager.applied().await.unwrap();
        assert_eq!(
            applied.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
        assert_eq!(applied[0].name, "CreateAttemptRecordsTable");
    }

    #[tokio::test]
    async fn test_down_removes_records() {
        let manager = manager().await;
        manager.up(&all()).await.unwrap();
        manager.down(&all()).await.unwrap();

        assert!(manager.applied().await.unwrap().is_empty());
        assert!(!manager.is_applied(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_out_of_order_migrations_rejected() {
        let manager = manager().await;
        let migrations: Vec<Box<dyn Migration>> =
            vec![Box::new(CreateCsrfTokensTable), Box::new(CreateAttemptRecordsTable)];

        let err = manager.up(&migrations).await.unwrap_err();
        assert!(matches!(err, MigrationError::Migration(_)));
        assert!(!manager.is_applied(3).await.unwrap());
    }
}
