//! # Conflict Resolution
//!
//! Settles a 409 from the cloud under the configured [`ConflictPolicy`].
//!
//! The conflict body is expected to look like:
//! ```json
//! { "cloud_data": [ { "id": "…", "power": 98.0, "timestamp": "…" } ] }
//! ```
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EDGE_PRIORITY   → resolved, store untouched                            │
//! │  CLOUD_PRIORITY  → every cloud row of the batch applied                 │
//! │  TIMESTAMP       → cloud rows applied only where strictly newer         │
//! │                                                                         │
//! │  Missing cloud_data, or a failed apply → ConflictUnresolvable           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use fieldgate_core::SyncTable;
use fieldgate_db::Database;

use crate::config::ConflictPolicy;
use crate::error::{SyncError, SyncResult};

/// What a successful resolution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resolution {
    /// Local rows overwritten with cloud values.
    pub applied: u64,
    /// Cloud rows ignored because local was as new or newer.
    pub kept_local: u64,
}

pub struct ConflictResolver {
    policy: ConflictPolicy,
    db: Database,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy, db: Database) -> Self {
        ConflictResolver { policy, db }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolves one conflicted batch.
    ///
    /// `local` holds the hydrated rows that were sent, keyed by record id.
    pub async fn resolve(
        &self,
        table: SyncTable,
        local: &HashMap<String, Value>,
        body: &Value,
    ) -> SyncResult<Resolution> {
        let resolution = match self.policy {
            ConflictPolicy::EdgePriority => Resolution::default(),

            ConflictPolicy::CloudPriority => {
                let remote = cloud_rows(body)?;
                let ids: Vec<String> = local.keys().cloned().collect();
                Resolution {
                    applied: self.apply(table, &remote, &ids).await?,
                    kept_local: 0,
                }
            }

            ConflictPolicy::Timestamp => {
                let remote = cloud_rows(body)?;
                let (newer, older): (Vec<Value>, Vec<Value>) =
                    remote.into_iter().partition(|row| {
                        row.get("id")
                            .and_then(Value::as_str)
                            .and_then(|id| local.get(id))
                            .is_some_and(|local_row| is_remote_newer(local_row, row))
                    });
                let ids: Vec<String> = local.keys().cloned().collect();
                Resolution {
                    applied: self.apply(table, &newer, &ids).await?,
                    kept_local: older.len() as u64,
                }
            }
        };

        info!(
            table = %table,
            policy = %self.policy,
            applied = resolution.applied,
            kept_local = resolution.kept_local,
            "Conflict resolved"
        );
        Ok(resolution)
    }

    async fn apply(&self, table: SyncTable, rows: &[Value], ids: &[String]) -> SyncResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.db
            .records()
            .apply_remote(table, rows, ids)
            .await
            .map_err(|e| SyncError::ConflictUnresolvable(e.to_string()))
    }
}

/// Extracts the `cloud_data` array from a conflict body.
pub fn cloud_rows(body: &Value) -> SyncResult<Vec<Value>> {
    body.get("cloud_data")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| SyncError::ConflictUnresolvable("conflict body has no cloud_data".into()))
}

/// True when the remote row's `timestamp` (or `updated_at`) is strictly
/// later than the local row's. Unparseable timestamps never win.
pub fn is_remote_newer(local: &Value, remote: &Value) -> bool {
    let local_ts = row_timestamp(local);
    let remote_ts = row_timestamp(remote);
    debug!(?local_ts, ?remote_ts, "Comparing conflict timestamps");

    match (local_ts, remote_ts) {
        (Some(l), Some(r)) => r > l,
        (None, Some(_)) => true,
        _ => false,
    }
}

fn row_timestamp(row: &Value) -> Option<DateTime<Utc>> {
    ["timestamp", "updated_at"]
        .iter()
        .filter_map(|key| row.get(*key).and_then(Value::as_str))
        .find_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::Reading;
    use fieldgate_db::DbConfig;
    use serde_json::json;

    async fn seeded() -> (Database, Reading, HashMap<String, Value>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let reading = Reading::new("inv-1", "inverter").with_power(120.5);
        db.readings().insert(&reading).await.unwrap();
        let local = db
            .records()
            .hydrate(SyncTable::EnergyReadings, &[reading.id.clone()])
            .await
            .unwrap();
        (db, reading, local)
    }

    #[test]
    fn test_timestamp_comparison() {
        let local = json!({"timestamp": "2026-01-01T00:00:00Z"});
        assert!(is_remote_newer(&local, &json!({"timestamp": "2026-01-01T00:00:01Z"})));
        assert!(is_remote_newer(&local, &json!({"updated_at": "2026-01-02T00:00:00+00:00"})));
        // Ties go to local.
        assert!(!is_remote_newer(&local, &json!({"timestamp": "2026-01-01T00:00:00Z"})));
        assert!(!is_remote_newer(&local, &json!({"timestamp": "2025-12-31T23:59:59Z"})));
        assert!(!is_remote_newer(&local, &json!({"timestamp": "yesterday"})));
    }

    #[test]
    fn test_cloud_rows_requires_array() {
        assert_eq!(cloud_rows(&json!({"cloud_data": [{"id": "x"}]})).unwrap().len(), 1);
        assert!(cloud_rows(&json!({"error": "conflict"})).is_err());
        assert!(cloud_rows(&Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_edge_priority_leaves_store_alone() {
        let (db, reading, local) = seeded().await;
        let resolver = ConflictResolver::new(ConflictPolicy::EdgePriority, db.clone());
        let body = json!({"cloud_data": [{"id": reading.id, "power": 1.0}]});

        let resolution = resolver.resolve(SyncTable::EnergyReadings, &local, &body).await.unwrap();
        assert_eq!(resolution.applied, 0);
        let stored = db.readings().get_by_id(&reading.id).await.unwrap().unwrap();
        assert_eq!(stored.power, Some(120.5));
    }

    #[tokio::test]
    async fn test_cloud_priority_overwrites() {
        let (db, reading, local) = seeded().await;
        let resolver = ConflictResolver::new(ConflictPolicy::CloudPriority, db.clone());
        let body = json!({"cloud_data": [{"id": reading.id, "power": 98.0, "device_id": "hijack"}]});

        let resolution = resolver.resolve(SyncTable::EnergyReadings, &local, &body).await.unwrap();
        assert_eq!(resolution.applied, 1);
        let stored = db.readings().get_by_id(&reading.id).await.unwrap().unwrap();
        assert_eq!(stored.power, Some(98.0));
        assert_eq!(stored.device_id, "inv-1");
    }

    #[tokio::test]
    async fn test_timestamp_policy_only_applies_newer() {
        let (db, reading, local) = seeded().await;
        let resolver = ConflictResolver::new(ConflictPolicy::Timestamp, db.clone());

        let older = (reading.timestamp - chrono::Duration::minutes(5)).to_rfc3339();
        let body = json!({"cloud_data": [{"id": reading.id, "power": 1.0, "timestamp": older}]});
        let resolution = resolver.resolve(SyncTable::EnergyReadings, &local, &body).await.unwrap();
        assert_eq!(resolution, Resolution { applied: 0, kept_local: 1 });
        assert_eq!(
            db.readings().get_by_id(&reading.id).await.unwrap().unwrap().power,
            Some(120.5)
        );

        let newer = (reading.timestamp + chrono::Duration::minutes(5)).to_rfc3339();
        let body = json!({"cloud_data": [{"id": reading.id, "power": 2.0, "timestamp": newer}]});
        let resolution = resolver.resolve(SyncTable::EnergyReadings, &local, &body).await.unwrap();
        assert_eq!(resolution.applied, 1);
        assert_eq!(
            db.readings().get_by_id(&reading.id).await.unwrap().unwrap().power,
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_unresolvable() {
        let (db, _reading, local) = seeded().await;
        let resolver = ConflictResolver::new(ConflictPolicy::CloudPriority, db);
        let err = resolver
            .resolve(SyncTable::EnergyReadings, &local, &json!("conflict"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConflictUnresolvable(_)));
    }
}
