//! Ingestion → store → sync, through the assembled gateway context.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use fieldgate_core::{DeviceConfig, DeviceType, SyncTable};
use fieldgate_db::{Database, DbConfig};
use fieldgate_gateway::{GatewayConfig, GatewayContext};
use fieldgate_ingest::{Connector, IngestError, IngestResult, RegisterIo};
use fieldgate_sync::{SyncEnvelope, SyncResult, Transport, TransportAck};

/// Records every envelope and acknowledges it.
#[derive(Default)]
struct RecordingTransport {
    envelopes: Mutex<Vec<SyncEnvelope>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, envelope: &SyncEnvelope) -> SyncResult<TransportAck> {
        self.envelopes.lock().unwrap().push(envelope.clone());
        Ok(TransportAck::Delivered)
    }
}

/// Every device is unreachable.
struct OfflineConnector;

#[async_trait]
impl Connector for OfflineConnector {
    async fn connect(&self, device: &DeviceConfig) -> IngestResult<Box<dyn RegisterIo>> {
        Err(IngestError::Connection(format!("{} unreachable", device.name)))
    }
}

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.mqtt.enabled = false;
    config.storage.backup_enabled = false;
    config.sync.cloud_api_url = Some("http://127.0.0.1:9".into());
    config
}

async fn context_with(
    config: GatewayConfig,
    transport: Arc<RecordingTransport>,
) -> GatewayContext {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let transport: Arc<dyn Transport> = transport;
    GatewayContext::from_parts(config, db, Some(transport), Arc::new(OfflineConnector))
        .await
        .unwrap()
}

async fn wait_for_pending(db: &Database, expected: i64) {
    for _ in 0..200 {
        if db.sync_outbox().count_pending().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pending count never reached {}", expected);
}

#[tokio::test]
async fn test_mqtt_reading_reaches_cloud() {
    let transport = Arc::new(RecordingTransport::default());
    let context = context_with(test_config(), Arc::clone(&transport)).await;

    let matched = context
        .router()
        .dispatch("fieldgate/energy/inv-1/data", json!({"power": 120.5}))
        .await;
    assert_eq!(matched, 1);
    wait_for_pending(context.db(), 1).await;

    let summary = context.sync_now().await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.records_synced, 1);

    let status = context.status().await.unwrap();
    let sync = status.sync.unwrap();
    assert_eq!(sync.pending_count, 0);
    assert_eq!(sync.total_synced, 1);
    assert_eq!(status.store.readings, 1);

    let envelopes = transport.envelopes.lock().unwrap().clone();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].table, SyncTable::EnergyReadings);
    assert_eq!(envelopes[0].data[0]["device_id"], "inv-1");
    assert_eq!(envelopes[0].data[0]["power"], 120.5);

    context.shutdown().await;
}

#[tokio::test]
async fn test_alerts_and_readings_sync_per_table() {
    let transport = Arc::new(RecordingTransport::default());
    let context = context_with(test_config(), Arc::clone(&transport)).await;

    context
        .router()
        .dispatch("fieldgate/energy/inv-1/data", json!({"data": {"power": 10.0}}))
        .await;
    context
        .router()
        .dispatch(
            "fieldgate/alerts/inv-1/over_voltage",
            json!({"severity": "warning", "message": "Grid voltage high"}),
        )
        .await;
    wait_for_pending(context.db(), 2).await;

    let summary = context.sync_now().await.unwrap();
    assert_eq!(summary.records_synced, 2);

    let mut tables: Vec<SyncTable> = transport
        .envelopes
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.table)
        .collect();
    tables.sort();
    assert_eq!(tables.len(), 2);
    assert!(tables.contains(&SyncTable::EnergyReadings));
    assert!(tables.contains(&SyncTable::Alerts));

    // Nothing left to send.
    let second = context.sync_now().await.unwrap();
    assert_eq!(second.records_synced, 0);
    assert_eq!(transport.envelopes.lock().unwrap().len(), 2);

    context.shutdown().await;
}

#[tokio::test]
async fn test_start_and_drain_with_unreachable_device() {
    let mut config = test_config();
    let mut device = DeviceConfig::tcp("inv-offline", DeviceType::Inverter, "10.255.255.1", 502);
    device.poll_interval_secs = 1;
    device.retries = 1;
    config.modbus.devices = vec![device];

    let transport = Arc::new(RecordingTransport::default());
    let mut context = context_with(config, transport).await;
    context.start().await.unwrap();

    assert_eq!(context.poller().devices().await, vec!["inv-offline".to_string()]);

    let mut errored = false;
    for _ in 0..300 {
        if context.poller().stats().await.connection_errors > 0 {
            errored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(errored);

    tokio::time::timeout(Duration::from_secs(5), context.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disabled_sync_has_no_engine() {
    let mut config = test_config();
    config.sync.enabled = false;
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let context = GatewayContext::from_parts(config, db, None, Arc::new(OfflineConnector))
        .await
        .unwrap();

    assert!(context.sync_engine().is_none());
    assert!(context.sync_now().await.is_none());
    assert!(context.status().await.unwrap().sync.is_none());
    context.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stores_every_dispatched_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");

    let db = Database::new(DbConfig::new(&path)).await.unwrap();
    let mut config = test_config();
    config.sync.enabled = false;
    let context = GatewayContext::from_parts(config, db, None, Arc::new(OfflineConnector))
        .await
        .unwrap();

    for i in 0..200 {
        let topic = format!("fieldgate/energy/d{i}/data");
        assert_eq!(context.router().dispatch(&topic, json!({"power": i})).await, 1);
    }
    context.shutdown().await;

    let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
    assert_eq!(reopened.readings().count().await.unwrap(), 200);
    assert_eq!(reopened.sync_outbox().count_pending().await.unwrap(), 200);
    reopened.close().await;
}
