//! # Sync Record Repository
//!
//! Table-generic access used by the sync engine: load outbox targets as JSON
//! for transmission, and write cloud-side rows back when the cloud wins a
//! conflict.
//!
//! ## Remote Apply
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  remote row {id, power: 99.0, quality: "bad", device_id: "x", foo: 1}  │
//! │       │                                                                 │
//! │       ▼   whitelist per table                                          │
//! │  power    → Real       ✓ bound                                         │
//! │  quality  → Choice     ✓ "bad" is allowed                              │
//! │  device_id              ✗ identity column, never overwritten           │
//! │  foo                    ✗ unknown, ignored                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  UPDATE energy_readings SET power = ?, quality = ? WHERE id = ?        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::error::DbResult;
use crate::repository::alert::AlertRepository;
use crate::repository::prediction::PredictionRepository;
use crate::repository::reading::ReadingRepository;
use fieldgate_core::SyncTable;

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Real,
    Text,
    Json,
    Bool,
    Timestamp,
    Choice(&'static [&'static str]),
}

const READING_COLUMNS: &[(&str, ColumnKind)] = &[
    ("timestamp", ColumnKind::Timestamp),
    ("power", ColumnKind::Real),
    ("voltage", ColumnKind::Real),
    ("current", ColumnKind::Real),
    ("frequency", ColumnKind::Real),
    ("power_factor", ColumnKind::Real),
    ("energy", ColumnKind::Real),
    ("temperature", ColumnKind::Real),
    ("raw_data", ColumnKind::Json),
    ("quality", ColumnKind::Choice(&["good", "uncertain", "bad"])),
];

const ALERT_COLUMNS: &[(&str, ColumnKind)] = &[
    ("alert_type", ColumnKind::Text),
    ("severity", ColumnKind::Choice(&["critical", "warning", "info"])),
    ("message", ColumnKind::Text),
    ("timestamp", ColumnKind::Timestamp),
    ("acknowledged", ColumnKind::Bool),
    ("resolved", ColumnKind::Bool),
    ("metadata", ColumnKind::Json),
];

const PREDICTION_COLUMNS: &[(&str, ColumnKind)] = &[
    ("model_name", ColumnKind::Text),
    ("prediction_type", ColumnKind::Text),
    ("input_data", ColumnKind::Json),
    ("prediction_result", ColumnKind::Json),
    ("confidence", ColumnKind::Real),
    ("timestamp", ColumnKind::Timestamp),
];

fn mutable_columns(table: SyncTable) -> &'static [(&'static str, ColumnKind)] {
    match table {
        SyncTable::EnergyReadings => READING_COLUMNS,
        SyncTable::Alerts => ALERT_COLUMNS,
        SyncTable::AiPredictions => PREDICTION_COLUMNS,
    }
}

enum Bound {
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// Converts one remote field to a bindable value, or `None` if it doesn't
/// fit the column.
fn coerce(kind: ColumnKind, value: &Value) -> Option<Bound> {
    match kind {
        ColumnKind::Real => value.as_f64().map(Bound::Real),
        ColumnKind::Text => value.as_str().map(|s| Bound::Text(s.to_string())),
        ColumnKind::Json => serde_json::to_string(value).ok().map(Bound::Text),
        ColumnKind::Bool => value
            .as_bool()
            .or_else(|| value.as_i64().map(|n| n != 0))
            .map(Bound::Bool),
        ColumnKind::Timestamp => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| Bound::Timestamp(ts.with_timezone(&Utc))),
        ColumnKind::Choice(allowed) => value
            .as_str()
            .filter(|s| allowed.contains(s))
            .map(|s| Bound::Text(s.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct SyncRecordRepository {
    pool: SqlitePool,
}

impl SyncRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncRecordRepository { pool }
    }

    /// Loads the rows behind a batch of outbox entries as JSON objects,
    /// keyed by record id. Ids without a row are absent from the map.
    pub async fn hydrate(
        &self,
        table: SyncTable,
        ids: &[String],
    ) -> DbResult<HashMap<String, Value>> {
        let mut rows = HashMap::with_capacity(ids.len());
        match table {
            SyncTable::EnergyReadings => {
                for r in ReadingRepository::new(self.pool.clone()).get_by_ids(ids).await? {
                    rows.insert(r.id.clone(), serde_json::to_value(&r)?);
                }
            }
            SyncTable::Alerts => {
                for a in AlertRepository::new(self.pool.clone()).get_by_ids(ids).await? {
                    rows.insert(a.id.clone(), serde_json::to_value(&a)?);
                }
            }
            SyncTable::AiPredictions => {
                for p in PredictionRepository::new(self.pool.clone()).get_by_ids(ids).await? {
                    rows.insert(p.id.clone(), serde_json::to_value(&p)?);
                }
            }
        }
        Ok(rows)
    }

    /// Overwrites local rows with cloud-side values, in one transaction.
    ///
    /// Only rows whose `id` is in `allowed_ids` are touched. Within a row,
    /// only the table's mutable columns are written; identity columns,
    /// unknown fields and values of the wrong shape are ignored.
    ///
    /// ## Returns
    /// Number of local rows updated.
    pub async fn apply_remote(
        &self,
        table: SyncTable,
        remote: &[Value],
        allowed_ids: &[String],
    ) -> DbResult<u64> {
        let columns = mutable_columns(table);
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for row in remote {
            let Some(id) = row.get("id").and_then(Value::as_str) else {
                warn!(table = %table, "Remote row without id ignored");
                continue;
            };
            if !allowed_ids.iter().any(|allowed| allowed == id) {
                warn!(table = %table, record_id = %id, "Remote row outside batch ignored");
                continue;
            }

            let fields: Vec<(&str, Bound)> = columns
                .iter()
                .filter_map(|(name, kind)| {
                    row.get(*name).and_then(|v| coerce(*kind, v)).map(|b| (*name, b))
                })
                .collect();
            if fields.is_empty() {
                continue;
            }

            let mut query = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", table.as_str()));
            let mut separated = query.separated(", ");
            for (name, bound) in fields {
                separated.push(format!("{name} = "));
                match bound {
                    Bound::Real(v) => separated.push_bind_unseparated(v),
                    Bound::Text(v) => separated.push_bind_unseparated(v),
                    Bound::Bool(v) => separated.push_bind_unseparated(v),
                    Bound::Timestamp(v) => separated.push_bind_unseparated(v),
                };
            }
            query.push(" WHERE id = ").push_bind(id.to_string());

            updated += query.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        debug!(table = %table, updated, "Applied cloud rows");
        Ok(updated)
    }
}
