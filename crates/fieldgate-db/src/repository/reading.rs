//! # Energy Reading Repository
//!
//! Readings are append-only. Every insert writes the row and its outbox
//! entry in one transaction, so a reading that exists locally is always
//! on its way to the cloud.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::sync::SyncOutboxRepository;
use fieldgate_core::{Reading, ReadingQuality, SyncTable};

const SELECT_COLUMNS: &str = "SELECT id, device_id, device_type, timestamp, power, voltage, \
     current, frequency, power_factor, energy, temperature, raw_data, quality, created_at \
     FROM energy_readings";

/// Filter for [`ReadingRepository::list`]. Unset fields don't filter.
#[derive(Debug, Clone)]
pub struct ReadingFilter {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for ReadingFilter {
    fn default() -> Self {
        ReadingFilter {
            device_id: None,
            start: None,
            end: None,
            limit: 1000,
        }
    }
}

impl ReadingFilter {
    pub fn device(device_id: impl Into<String>) -> Self {
        ReadingFilter {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: String,
    device_id: String,
    device_type: String,
    timestamp: DateTime<Utc>,
    power: Option<f64>,
    voltage: Option<f64>,
    current: Option<f64>,
    frequency: Option<f64>,
    power_factor: Option<f64>,
    energy: Option<f64>,
    temperature: Option<f64>,
    raw_data: String,
    quality: ReadingQuality,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = DbError;

    fn try_from(row: ReadingRow) -> DbResult<Self> {
        Ok(Reading {
            id: row.id,
            device_id: row.device_id,
            device_type: row.device_type,
            timestamp: row.timestamp,
            power: row.power,
            voltage: row.voltage,
            current: row.current,
            frequency: row.frequency,
            power_factor: row.power_factor,
            energy: row.energy,
            temperature: row.temperature,
            raw_data: serde_json::from_str(&row.raw_data)?,
            quality: row.quality,
            created_at: row.created_at,
        })
    }
}

/// Repository for energy readings.
#[derive(Debug, Clone)]
pub struct ReadingRepository {
    pool: SqlitePool,
}

impl ReadingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ReadingRepository { pool }
    }

    /// Stores a reading and queues it for sync.
    ///
    /// ## Returns
    /// The outbox id of the new sync entry. On error neither row exists.
    pub async fn insert(&self, reading: &Reading) -> DbResult<i64> {
        let raw_data = serde_json::to_string(&reading.raw_data)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO energy_readings (
                id, device_id, device_type, timestamp, power, voltage, current,
                frequency, power_factor, energy, temperature, raw_data, quality, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&reading.id)
        .bind(&reading.device_id)
        .bind(&reading.device_type)
        .bind(reading.timestamp)
        .bind(reading.power)
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.frequency)
        .bind(reading.power_factor)
        .bind(reading.energy)
        .bind(reading.temperature)
        .bind(raw_data)
        .bind(reading.quality)
        .bind(reading.created_at)
        .execute(&mut *tx)
        .await?;

        let outbox_id =
            SyncOutboxRepository::enqueue(&mut tx, SyncTable::EnergyReadings, &reading.id).await?;

        tx.commit().await?;

        debug!(device_id = %reading.device_id, reading_id = %reading.id, "Reading stored");
        Ok(outbox_id)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Reading>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row = sqlx::query_as::<_, ReadingRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Reading::try_from).transpose()
    }

    /// Loads every reading whose id is in `ids`. Missing ids are skipped.
    pub async fn get_by_ids(&self, ids: &[String]) -> DbResult<Vec<Reading>> {
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

        let rows: Vec<ReadingRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    /// Lists readings, newest first.
    pub async fn list(&self, filter: &ReadingFilter) -> DbResult<Vec<Reading>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE 1 = 1");
        if let Some(device_id) = &filter.device_id {
            query.push(" AND device_id = ").push_bind(device_id);
        }
        if let Some(start) = filter.start {
            query.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = filter.end {
            query.push(" AND timestamp <= ").push_bind(end);
        }
        query.push(" ORDER BY timestamp DESC LIMIT ").push_bind(filter.limit);

        let rows: Vec<ReadingRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM energy_readings")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use fieldgate_core::OutboxStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_creates_one_pending_entry() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut reading = Reading::new("inv-1", "inverter").with_power(120.5);
        reading.raw_data = json!({"Active Power": 120.5});

        let outbox_id = db.readings().insert(&reading).await.unwrap();

        let entries = db
            .sync_outbox()
            .list_for_record(SyncTable::EnergyReadings, &reading.id)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, outbox_id);
        assert_eq!(entries[0].status, OutboxStatus::Pending);
        assert_eq!(entries[0].attempts, 0);

        let stored = db.readings().get_by_id(&reading.id).await.unwrap().unwrap();
        assert_eq!(stored.power, Some(120.5));
        assert_eq!(stored.raw_data, reading.raw_data);
        assert_eq!(stored.timestamp, reading.timestamp);
    }

    #[tokio::test]
    async fn test_insert_is_atomic() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        sqlx::query("DROP TABLE sync_outbox")
            .execute(db.pool())
            .await
            .unwrap();

        let reading = Reading::new("inv-1", "inverter").with_power(1.0);
        assert!(db.readings().insert(&reading).await.is_err());
        assert_eq!(db.readings().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_filters_newest_first() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let base = Utc::now();
        for (i, device) in ["a", "a", "b"].iter().enumerate() {
            let mut reading = Reading::new(*device, "meter");
            reading.timestamp = base - chrono::Duration::minutes(i as i64);
            db.readings().insert(&reading).await.unwrap();
        }

        let only_a = db.readings().list(&ReadingFilter::device("a")).await.unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a[0].timestamp > only_a[1].timestamp);

        let recent = db
            .readings()
            .list(&ReadingFilter {
                start: Some(base - chrono::Duration::seconds(30)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);

        let ids: Vec<String> = only_a.iter().map(|r| r.id.clone()).collect();
        assert_eq!(db.readings().get_by_ids(&ids).await.unwrap().len(), 2);
    }
}
