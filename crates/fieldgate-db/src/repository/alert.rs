//! # Alert Repository
//!
//! Alerts are inserted once and then only acknowledged or resolved. Each of
//! those writes re-queues the alert so the cloud sees the new flags.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::sync::SyncOutboxRepository;
use fieldgate_core::{Alert, Severity, SyncTable};

const SELECT_COLUMNS: &str = "SELECT id, device_id, alert_type, severity, message, timestamp, \
     acknowledged, resolved, metadata, created_at FROM alerts";

/// Filter for [`AlertRepository::list`].
#[derive(Debug, Clone)]
pub struct AlertFilter {
    pub device_id: Option<String>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: u32,
}

impl Default for AlertFilter {
    fn default() -> Self {
        AlertFilter {
            device_id: None,
            severity: None,
            acknowledged: None,
            limit: 100,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: String,
    device_id: String,
    alert_type: String,
    severity: Severity,
    message: String,
    timestamp: DateTime<Utc>,
    acknowledged: bool,
    resolved: bool,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = DbError;

    fn try_from(row: AlertRow) -> DbResult<Self> {
        Ok(Alert {
            id: row.id,
            device_id: row.device_id,
            alert_type: row.alert_type,
            severity: row.severity,
            message: row.message,
            timestamp: row.timestamp,
            acknowledged: row.acknowledged,
            resolved: row.resolved,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: row.created_at,
        })
    }
}

/// Repository for device alerts.
#[derive(Debug, Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AlertRepository { pool }
    }

    /// Stores an alert and queues it for sync. Returns the outbox id.
    pub async fn insert(&self, alert: &Alert) -> DbResult<i64> {
        let metadata = serde_json::to_string(&alert.metadata)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, device_id, alert_type, severity, message, timestamp,
                acknowledged, resolved, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.device_id)
        .bind(&alert.alert_type)
        .bind(alert.severity)
        .bind(&alert.message)
        .bind(alert.timestamp)
        .bind(alert.acknowledged)
        .bind(alert.resolved)
        .bind(metadata)
        .bind(alert.created_at)
        .execute(&mut *tx)
        .await?;

        let outbox_id = SyncOutboxRepository::enqueue(&mut tx, SyncTable::Alerts, &alert.id).await?;

        tx.commit().await?;

        info!(
            device_id = %alert.device_id,
            severity = %alert.severity,
            alert_type = %alert.alert_type,
            "Alert stored"
        );
        Ok(outbox_id)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Alert>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Alert::try_from).transpose()
    }

    /// Loads every alert whose id is in `ids`. Missing ids are skipped.
    pub async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<Alert>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<AlertRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Lists alerts, newest first.
    pub async fn list(&self, filter: &AlertFilter) -> DbResult<Vec<Alert>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE 1 = 1");
        if let Some(device_id) = &filter.device_id {
            query.push(" AND device_id = ").push_bind(device_id);
        }
        if let Some(severity) = filter.severity {
            query.push(" AND severity = ").push_bind(severity);
        }
        if let Some(acknowledged) = filter.acknowledged {
            query.push(" AND acknowledged = ").push_bind(acknowledged);
        }
        query.push(" ORDER BY timestamp DESC LIMIT ").push_bind(filter.limit);

        let rows: Vec<AlertRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Sets `acknowledged` and re-queues the alert.
    pub async fn acknowledge(&self, id: &str) -> DbResult<()> {
        self.set_flag(id, "acknowledged").await
    }

    /// Sets `resolved` and re-queues the alert.
    pub async fn resolve(&self, id: &str) -> DbResult<()> {
        self.set_flag(id, "resolved").await
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // `column` is one of two literals above, never caller input.
    async fn set_flag(&self, id: &str, column: &'static str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("UPDATE alerts SET {column} = 1 WHERE id = ?1");
        let result = sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Alert", id));
        }

        SyncOutboxRepository::enqueue_if_absent(&mut tx, SyncTable::Alerts, id).await?;
        tx.commit().await?;

        debug!(alert_id = %id, flag = column, "Alert updated");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
