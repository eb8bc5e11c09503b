//! # Topic Handlers
//!
//! Turn inbound MQTT messages into store writes.
//!
//! ```text
//!   {prefix}/energy/{device_id}/data           → readings().insert
//!   {prefix}/devices/{device_id}/status        → device_status().upsert
//!   {prefix}/alerts/{device_id}/{alert_type}   → alerts().insert
//! ```
//!
//! Readings and alerts get their outbox row in the same transaction, so a
//! handler error means neither row exists.
//!
//! Levels are read by position under the prefix, never by searching for the
//! literal `energy`/`devices`/`alerts`: a device may be called `alerts`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use fieldgate_core::topic::segment;
use fieldgate_core::{Alert, DeviceState, DeviceStatus, Reading};
use fieldgate_db::Database;
use fieldgate_ingest::{IngestError, IngestResult, MessageHandler, MqttSettings, TopicRouter};

/// Where the variable levels sit in `{prefix}/{kind}/{device_id}/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicLevels {
    device: usize,
}

impl TopicLevels {
    pub fn under(prefix: &str) -> Self {
        TopicLevels {
            device: prefix.split('/').count() + 1,
        }
    }

    fn device_id<'a>(&self, topic: &'a str) -> IngestResult<&'a str> {
        segment(topic, self.device)
            .ok_or_else(|| IngestError::Payload(format!("no device id in topic '{}'", topic)))
    }

    /// Level after the device id, e.g. the alert type.
    fn detail<'a>(&self, topic: &'a str) -> IngestResult<&'a str> {
        segment(topic, self.device + 1)
            .ok_or_else(|| IngestError::Payload(format!("no alert type in topic '{}'", topic)))
    }
}

fn text(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

// =============================================================================
// Energy Data
// =============================================================================

pub struct EnergyDataHandler {
    db: Database,
    levels: TopicLevels,
}

impl EnergyDataHandler {
    pub fn new(db: Database, levels: TopicLevels) -> Self {
        EnergyDataHandler { db, levels }
    }
}

#[async_trait]
impl MessageHandler for EnergyDataHandler {
    async fn handle(&self, topic: &str, payload: Value) -> IngestResult<()> {
        let device_id = self.levels.device_id(topic)?;
        let reading = Reading::from_payload(device_id, &payload);
        self.db.readings().insert(&reading).await?;
        debug!(device_id, reading_id = %reading.id, "Stored MQTT reading");
        Ok(())
    }
}

// =============================================================================
// Device Status
// =============================================================================

pub struct DeviceStatusHandler {
    db: Database,
    levels: TopicLevels,
}

impl DeviceStatusHandler {
    pub fn new(db: Database, levels: TopicLevels) -> Self {
        DeviceStatusHandler { db, levels }
    }
}

/// Builds a status row from a status payload.
///
/// `status` is required. A bare string payload such as `"online"` is
/// accepted too.
pub fn status_from_payload(device_id: &str, payload: &Value) -> IngestResult<DeviceStatus> {
    let raw_state = payload
        .as_str()
        .or_else(|| payload.get("status").and_then(Value::as_str))
        .ok_or_else(|| IngestError::Payload("status payload has no 'status'".into()))?;
    let state: DeviceState = raw_state
        .parse()
        .map_err(|e: fieldgate_core::CoreError| IngestError::Payload(e.to_string()))?;

    let device_type = text(payload, "device_type").unwrap_or_else(|| "unknown".to_string());
    let mut status = DeviceStatus::new(device_id, device_type, state);
    status.ip_address = text(payload, "ip_address");
    status.mac_address = text(payload, "mac_address");
    status.firmware_version = text(payload, "firmware_version");
    status.hardware_version = text(payload, "hardware_version");
    if let Some(metadata) = payload.get("metadata").filter(|m| m.is_object()) {
        status.metadata = metadata.clone();
    }
    Ok(status)
}

#[async_trait]
impl MessageHandler for DeviceStatusHandler {
    async fn handle(&self, topic: &str, payload: Value) -> IngestResult<()> {
        let device_id = self.levels.device_id(topic)?;
        let status = status_from_payload(device_id, &payload)?;
        self.db.device_status().upsert(&status).await?;
        Ok(())
    }
}

// =============================================================================
// Alerts
// =============================================================================

pub struct AlertHandler {
    db: Database,
    levels: TopicLevels,
}

impl AlertHandler {
    pub fn new(db: Database, levels: TopicLevels) -> Self {
        AlertHandler { db, levels }
    }
}

#[async_trait]
impl MessageHandler for AlertHandler {
    async fn handle(&self, topic: &str, payload: Value) -> IngestResult<()> {
        let device_id = self.levels.device_id(topic)?;
        let alert_type = self.levels.detail(topic)?;

        let alert = Alert::from_payload(device_id, alert_type, &payload);
        self.db.alerts().insert(&alert).await?;
        debug!(device_id, alert_type, severity = ?alert.severity, "Stored MQTT alert");
        Ok(())
    }
}

/// Registers the three store-writing handlers under the configured prefix.
pub async fn register_default_handlers(
    router: &TopicRouter,
    db: &Database,
    settings: &MqttSettings,
) -> IngestResult<()> {
    let prefix = &settings.topic_prefix;
    let levels = TopicLevels::under(prefix);
    router
        .register_handler(
            &format!("{prefix}/energy/+/data"),
            Arc::new(EnergyDataHandler::new(db.clone(), levels)),
        )
        .await?;
    router
        .register_handler(
            &format!("{prefix}/devices/+/status"),
            Arc::new(DeviceStatusHandler::new(db.clone(), levels)),
        )
        .await?;
    router
        .register_handler(
            &format!("{prefix}/alerts/+/+"),
            Arc::new(AlertHandler::new(db.clone(), levels)),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{Severity, SyncTable};
    use fieldgate_db::DbConfig;
    use serde_json::json;

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_energy_handler_stores_reading_and_outbox() {
        let db = db().await;
        let handler = EnergyDataHandler::new(db.clone(), TopicLevels::under("fieldgate"));

        handler
            .handle("fieldgate/energy/inv-1/data", json!({"data": {"power": 120.5, "voltage": 230.0}}))
            .await
            .unwrap();

        let pending = db.sync_outbox().get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table_name, SyncTable::EnergyReadings);

        let reading = db.readings().get_by_id(&pending[0].record_id).await.unwrap().unwrap();
        assert_eq!(reading.device_id, "inv-1");
        assert_eq!(reading.power, Some(120.5));
    }

    #[tokio::test]
    async fn test_status_handler_upserts() {
        let db = db().await;
        let handler = DeviceStatusHandler::new(db.clone(), TopicLevels::under("site"));
        let topic = "site/devices/meter-7/status";

        handler
            .handle(topic, json!({"status": "online", "device_type": "meter", "firmware_version": "1.2"}))
            .await
            .unwrap();
        handler.handle(topic, json!("offline")).await.unwrap();

        let stored = db.device_status().get("meter-7").await.unwrap().unwrap();
        assert_eq!(stored.status, DeviceState::Offline);
        assert_eq!(stored.firmware_version.as_deref(), Some("1.2"));
        assert_eq!(db.device_status().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_handler_rejects_unknown_state() {
        let db = db().await;
        let handler = DeviceStatusHandler::new(db.clone(), TopicLevels::under("site"));
        let err = handler
            .handle("site/devices/meter-7/status", json!({"status": "sleepy"}))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Payload(_)));
        assert!(db.device_status().get("meter-7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alert_handler_reads_topic_segments() {
        let db = db().await;
        let handler = AlertHandler::new(db.clone(), TopicLevels::under("fieldgate"));

        handler
            .handle(
                "fieldgate/alerts/bat-2/over_temperature",
                json!({"severity": "critical", "message": "Cell temperature 71C"}),
            )
            .await
            .unwrap();

        let pending = db.sync_outbox().get_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let alert = db.alerts().get_by_id(&pending[0].record_id).await.unwrap().unwrap();
        assert_eq!(alert.device_id, "bat-2");
        assert_eq!(alert.alert_type, "over_temperature");
        assert_eq!(alert.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_device_named_like_a_topic_level() {
        let db = db().await;
        let levels = TopicLevels::under("fieldgate");

        EnergyDataHandler::new(db.clone(), levels)
            .handle("fieldgate/energy/energy/data", json!({"power": 5.0}))
            .await
            .unwrap();
        let alerts = AlertHandler::new(db.clone(), levels);
        alerts
            .handle("fieldgate/alerts/alerts/overheat", json!({"message": "hot"}))
            .await
            .unwrap();
        alerts.handle("fieldgate/alerts/x/x", json!({"message": "x"})).await.unwrap();

        let readings = db.readings().list(&Default::default()).await.unwrap();
        assert_eq!(readings[0].device_id, "energy");

        let stored = db.alerts().list(&Default::default()).await.unwrap();
        let mut pairs: Vec<(String, String)> = stored
            .iter()
            .map(|a| (a.device_id.clone(), a.alert_type.clone()))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("alerts".to_string(), "overheat".to_string()),
                ("x".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn test_levels_follow_prefix_depth() {
        let levels = TopicLevels::under("plant/north");
        assert_eq!(levels.device_id("plant/north/energy/inv-1/data").unwrap(), "inv-1");
        assert_eq!(levels.detail("plant/north/alerts/inv-1/overheat").unwrap(), "overheat");
        assert!(levels.device_id("plant/north/energy").is_err());
    }

    #[tokio::test]
    async fn test_default_handlers_registered_under_prefix() {
        let db = db().await;
        let router = TopicRouter::new();
        let settings = MqttSettings {
            topic_prefix: "plant".into(),
            ..MqttSettings::default()
        };
        register_default_handlers(&router, &db, &settings).await.unwrap();

        assert_eq!(router.handler_count().await, 3);
        assert_eq!(router.dispatch("plant/energy/inv-1/data", json!({"power": 1.0})).await, 1);
        assert_eq!(router.dispatch("other/energy/inv-1/data", json!({"power": 1.0})).await, 0);
    }
}
