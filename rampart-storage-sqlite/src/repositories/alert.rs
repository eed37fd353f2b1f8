//! SQLite implementation of the security event log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rampart_core::{
    Error,
    error::StorageError,
    repositories::AlertRepository,
    storage::{AlertFilter, AlertSeverity, SecurityAlert},
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{database_error, from_millis, to_millis};

const ALERT_COLUMNS: &str =
    "id, alert_type, severity, identity, rule_name, message, timestamp, resolved, resolved_at";

/// SQLite repository for security alerts.
pub struct SqliteAlertRepository {
    pool: SqlitePool,
}

impl SqliteAlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SqliteSecurityAlert {
    id: String,
    alert_type: String,
    severity: String,
    identity: String,
    rule_name: Option<String>,
    message: String,
    timestamp: i64,
    resolved: bool,
    resolved_at: Option<i64>,
}

impl TryFrom<SqliteSecurityAlert> for SecurityAlert {
    type Error = Error;

    fn try_from(row: SqliteSecurityAlert) -> Result<Self, Self::Error> {
        let corrupt = |e: rampart_core::error::ConfigurationError| {
            Error::Storage(StorageError::Serialization(e.to_string()))
        };

        Ok(SecurityAlert {
            id: row.id,
            alert_type: row.alert_type.parse().map_err(corrupt)?,
            severity: row.severity.parse().map_err(corrupt)?,
            identity: row.identity,
            rule_name: row.rule_name,
            message: row.message,
            timestamp: from_millis(row.timestamp)?,
            resolved: row.resolved,
            resolved_at: row.resolved_at.map(from_millis).transpose()?,
        })
    }
}

fn severity_rank(severity: AlertSeverity) -> i64 {
    match severity {
        AlertSeverity::Low => 0,
        AlertSeverity::Medium => 1,
        AlertSeverity::High => 2,
        AlertSeverity::Critical => 3,
    }
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn append(&self, alert: SecurityAlert) -> Result<SecurityAlert, Error> {
        sqlx::query(
            r#"
            INSERT INTO security_alerts
                (id, alert_type, severity, severity_rank, identity, rule_name, message, timestamp, resolved, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(severity_rank(alert.severity))
        .bind(&alert.identity)
        .bind(&alert.rule_name)
        .bind(&alert.message)
        .bind(to_millis(alert.timestamp))
        .bind(alert.resolved)
        .bind(alert.resolved_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to append security alert"))?;

        Ok(alert)
    }

    async fn find(&self, id: &str) -> Result<Option<SecurityAlert>, Error> {
        let row = sqlx::query_as::<_, SqliteSecurityAlert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("Failed to find security alert"))?;

        row.map(SecurityAlert::try_from).transpose()
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<SecurityAlert>, Error> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {ALERT_COLUMNS} FROM security_alerts WHERE 1 = 1"
        ));

        if let Some(resolved) = filter.resolved {
            query.push(" AND resolved = ").push_bind(resolved);
        }
        if let Some(alert_type) = filter.alert_type {
            query.push(" AND alert_type = ").push_bind(alert_type.as_str());
        }
        if let Some(min_severity) = filter.min_severity {
            query
                .push(" AND severity_rank >= ")
                .push_bind(severity_rank(min_severity));
        }
        if let Some(identity) = &filter.identity {
            query.push(" AND identity = ").push_bind(identity.clone());
        }
        query.push(" ORDER BY timestamp DESC, seq DESC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query
            .build_query_as::<SqliteSecurityAlert>()
            .fetch_all(&self.pool)
            .await
            .map_err(database_error("Failed to list security alerts"))?;

        rows.into_iter().map(SecurityAlert::try_from).collect()
    }

    async fn resolve(&self, id: &str, resolved_at: DateTime<Utc>) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE security_alerts SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0",
        )
        .bind(to_millis(resolved_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error("Failed to resolve security alert"))?;

        Ok(result.rows_affected() == 1)
    }
}
