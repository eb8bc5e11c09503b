//! # Device Status Repository
//!
//! One row per device, last write wins. Status rows are local bookkeeping
//! and never enter the sync outbox.
//!
//! ## Upsert Semantics
//! ```text
//!  existing row                 incoming                   stored
//!  ─────────────                ────────                   ──────
//!  status = online              status = error        ──►  error
//!  firmware = "1.2"             firmware = None       ──►  "1.2"   (kept)
//!  metadata = {a:1, b:2}        metadata = {b:3}      ──►  {a:1, b:3}
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fieldgate_core::{merge_metadata, DeviceState, DeviceStatus};

const SELECT_COLUMNS: &str = "SELECT device_id, device_type, status, last_seen, ip_address, \
     mac_address, firmware_version, hardware_version, metadata FROM device_status";

#[derive(sqlx::FromRow)]
struct DeviceStatusRow {
    device_id: String,
    device_type: String,
    status: DeviceState,
    last_seen: DateTime<Utc>,
    ip_address: Option<String>,
    mac_address: Option<String>,
    firmware_version: Option<String>,
    hardware_version: Option<String>,
    metadata: String,
}

impl TryFrom<DeviceStatusRow> for DeviceStatus {
    type Error = DbError;

    fn try_from(row: DeviceStatusRow) -> DbResult<Self> {
        Ok(DeviceStatus {
            device_id: row.device_id,
            device_type: row.device_type,
            status: row.status,
            last_seen: row.last_seen,
            ip_address: row.ip_address,
            mac_address: row.mac_address,
            firmware_version: row.firmware_version,
            hardware_version: row.hardware_version,
            metadata: serde_json::from_str(&row.metadata)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceStatusRepository {
    pool: SqlitePool,
}

impl DeviceStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceStatusRepository { pool }
    }

    /// Inserts or updates the status row for `status.device_id`.
    ///
    /// Optional fields left `None` keep their stored value; metadata is
    /// shallow-merged into the stored object.
    ///
    /// The upsert runs before the metadata read so the transaction holds the
    /// write lock from its first statement. A deferred transaction that reads
    /// first cannot upgrade once another writer commits, and SQLite answers
    /// `SQLITE_BUSY` without waiting on `busy_timeout`.
    pub async fn upsert(&self, status: &DeviceStatus) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO device_status (
                device_id, device_type, status, last_seen, ip_address, mac_address,
                firmware_version, hardware_version, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(device_id) DO UPDATE SET
                device_type = excluded.device_type,
                status = excluded.status,
                last_seen = excluded.last_seen,
                ip_address = COALESCE(excluded.ip_address, device_status.ip_address),
                mac_address = COALESCE(excluded.mac_address, device_status.mac_address),
                firmware_version = COALESCE(excluded.firmware_version, device_status.firmware_version),
                hardware_version = COALESCE(excluded.hardware_version, device_status.hardware_version)
            "#,
        )
        .bind(&status.device_id)
        .bind(&status.device_type)
        .bind(status.status)
        .bind(status.last_seen)
        .bind(&status.ip_address)
        .bind(&status.mac_address)
        .bind(&status.firmware_version)
        .bind(&status.hardware_version)
        .bind(serde_json::to_string(&status.metadata)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        // A fresh insert already stored the incoming object; merging it into
        // itself is a no-op.
        let stored: String =
            sqlx::query_scalar("SELECT metadata FROM device_status WHERE device_id = ?1")
                .bind(&status.device_id)
                .fetch_one(&mut *tx)
                .await?;
        let merged = merge_metadata(&serde_json::from_str(&stored)?, &status.metadata);

        sqlx::query("UPDATE device_status SET metadata = ?2 WHERE device_id = ?1")
            .bind(&status.device_id)
            .bind(serde_json::to_string(&merged)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(device_id = %status.device_id, status = ?status.status, "Device status updated");
        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> DbResult<Option<DeviceStatus>> {
        let sql = format!("{SELECT_COLUMNS} WHERE device_id = ?1");
        let row = sqlx::query_as::<_, DeviceStatusRow>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DeviceStatus::try_from).transpose()
    }

    pub async fn list_all(&self) -> DbResult<Vec<DeviceStatus>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY device_id ASC");
        let rows = sqlx::query_as::<_, DeviceStatusRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(DeviceStatus::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_status")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_merges_and_keeps_fields() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let mut first = DeviceStatus::new("inv-1", "inverter", DeviceState::Online);
        first.firmware_version = Some("1.2".into());
        first.metadata = json!({"site": "roof", "slot": 1});
        db.device_status().upsert(&first).await.unwrap();

        let mut second = DeviceStatus::new("inv-1", "inverter", DeviceState::Error);
        second.metadata = json!({"slot": 2, "error": "timeout"});
        db.device_status().upsert(&second).await.unwrap();

        let stored = db.device_status().get("inv-1").await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceState::Error);
        assert_eq!(stored.firmware_version.as_deref(), Some("1.2"));
        assert_eq!(
            stored.metadata,
            json!({"site": "roof", "slot": 2, "error": "timeout"})
        );
        assert_eq!(db.device_status().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_is_not_synced() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device_status()
            .upsert(&DeviceStatus::new("m-1", "meter", DeviceState::Online))
            .await
            .unwrap();

        assert_eq!(db.sync_outbox().count_pending().await.unwrap(), 0);
        assert_eq!(db.device_status().list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("status.db")))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..200 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                let mut status = DeviceStatus::new(format!("dev-{}", i % 4), "meter", DeviceState::Online);
                let mut metadata = serde_json::Map::new();
                metadata.insert(format!("k{i}"), json!(i));
                status.metadata = serde_json::Value::Object(metadata);
                db.device_status().upsert(&status).await
            }));
        }
        // Readings write concurrently, as pollers do.
        for i in 0..50 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                let reading = fieldgate_core::Reading::new(format!("dev-{}", i % 4), "meter").with_power(1.0);
                db.readings().insert(&reading).await.map(|_| ())
            }));
        }

        let mut errors = 0;
        for task in tasks {
            if task.await.unwrap().is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 0);

        let statuses = db.device_status().list_all().await.unwrap();
        assert_eq!(statuses.len(), 4);
        // Every upsert's key survived the merges.
        let keys: usize = statuses
            .iter()
            .map(|s| s.metadata.as_object().map(|m| m.len()).unwrap_or(0))
            .sum();
        assert_eq!(keys, 200);
        assert_eq!(db.readings().count().await.unwrap(), 50);
        db.close().await;
    }
}
