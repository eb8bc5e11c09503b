//! # Gateway Context
//!
//! Owns every long-lived component. Built once in `main` and passed by
//! reference; nothing in the gateway is reachable through globals.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          GatewayContext                                 │
//! │                                                                         │
//! │  Database ◄──── handlers ◄──── TopicRouter ◄──── MqttService            │
//! │     ▲  ▲                                                                │
//! │     │  └──────────────── DevicePoller (one loop per device)            │
//! │     │                                                                   │
//! │     ├──── SyncEngine + SyncLoop ──────► Transport ──────► cloud        │
//! │     └──── MaintenanceLoop (cleanup, backup)                            │
//! │                                                                         │
//! │  shutdown(): MQTT → pollers → sync loop → maintenance → transport → db │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use fieldgate_db::{Database, StoreStatistics};
use fieldgate_ingest::{Connector, DevicePoller, ModbusConnector, ModbusStats, MqttService, MqttStats, TopicRouter};
use fieldgate_sync::{build_transport, SyncEngine, SyncLoop, SyncStatus, SyncSummary, Transport};

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::handlers::register_default_handlers;
use crate::maintenance::{MaintenanceLoop, MaintenancePlan};

/// Point-in-time view of every component, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub gateway_id: String,
    pub store: StoreStatistics,
    pub sync: Option<SyncStatus>,
    pub modbus: ModbusStats,
    pub mqtt: Option<MqttStats>,
}

pub struct GatewayContext {
    config: GatewayConfig,
    db: Database,
    router: Arc<TopicRouter>,
    poller: DevicePoller,
    sync: Option<SyncEngine>,
    mqtt: Option<MqttService>,
    sync_loop: Option<SyncLoop>,
    maintenance: Option<MaintenanceLoop>,
}

impl GatewayContext {
    /// Opens the store and builds every component from configuration.
    ///
    /// Nothing runs in the background until [`GatewayContext::start`].
    pub async fn build(config: GatewayConfig) -> GatewayResult<Self> {
        let db = Database::new(config.db_config()).await?;
        let transport = if config.sync.enabled {
            Some(build_transport(&config.sync).await?)
        } else {
            None
        };
        Self::from_parts(config, db, transport, Arc::new(ModbusConnector)).await
    }

    /// Assembles a context around an existing store, transport and
    /// device connector.
    pub async fn from_parts(
        config: GatewayConfig,
        db: Database,
        transport: Option<Arc<dyn Transport>>,
        connector: Arc<dyn Connector>,
    ) -> GatewayResult<Self> {
        let router = Arc::new(TopicRouter::new());
        register_default_handlers(&router, &db, &config.mqtt).await?;

        let poller = DevicePoller::new(db.clone(), connector);
        let sync = transport.map(|t| SyncEngine::new(db.clone(), config.sync.clone(), t));

        Ok(GatewayContext {
            config,
            db,
            router,
            poller,
            sync,
            mqtt: None,
            sync_loop: None,
            maintenance: None,
        })
    }

    /// Starts polling, the MQTT receiver, and the periodic loops.
    pub async fn start(&mut self) -> GatewayResult<()> {
        for device in self.config.modbus.devices.clone() {
            self.poller.add_device(device).await?;
        }

        if self.config.mqtt.enabled {
            self.mqtt = Some(MqttService::start(
                self.config.mqtt.clone(),
                Arc::clone(&self.router),
            )?);
        }

        if let Some(engine) = &self.sync {
            self.sync_loop = Some(engine.start().await);
        } else {
            info!("Sync disabled");
        }

        let storage = &self.config.storage;
        self.maintenance = Some(MaintenanceLoop::start(
            self.db.clone(),
            MaintenancePlan {
                interval: Duration::from_secs(storage.backup_interval_hours * 3600),
                max_data_age_days: storage.max_data_age_days,
                backup: storage.backup_enabled.then(|| self.config.backup_options()),
            },
        ));

        info!(
            gateway_id = %self.config.gateway.id,
            devices = self.config.modbus.devices.len(),
            mqtt = self.config.mqtt.enabled,
            sync = self.sync.is_some(),
            "Gateway started"
        );
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    /// Runtime add/remove of register-based devices.
    pub fn poller(&self) -> &DevicePoller {
        &self.poller
    }

    pub fn sync_engine(&self) -> Option<&SyncEngine> {
        self.sync.as_ref()
    }

    pub fn mqtt(&self) -> Option<&MqttService> {
        self.mqtt.as_ref()
    }

    /// Runs a sync cycle now. `None` when sync is disabled.
    pub async fn sync_now(&self) -> Option<SyncSummary> {
        match &self.sync {
            Some(engine) => Some(engine.sync_now().await),
            None => None,
        }
    }

    pub async fn status(&self) -> GatewayResult<GatewayStatus> {
        let sync = match &self.sync {
            Some(engine) => Some(engine.status().await?),
            None => None,
        };
        let mqtt = match &self.mqtt {
            Some(service) => Some(service.stats().await),
            None => None,
        };

        Ok(GatewayStatus {
            gateway_id: self.config.gateway.id.clone(),
            store: self.db.statistics().await?,
            sync,
            modbus: self.poller.stats().await,
            mqtt,
        })
    }

    /// Stops every background task, waiting for in-flight work, then
    /// releases the transport and the store.
    pub async fn shutdown(mut self) {
        info!("Shutting down gateway");

        if let Some(mqtt) = self.mqtt.take() {
            mqtt.shutdown().await;
        }
        // Messages already acknowledged to the broker must reach the store.
        self.router.drain().await;
        self.poller.stop().await;

        if let Some(sync_loop) = self.sync_loop.take() {
            sync_loop.shutdown().await;
        }
        if let Some(maintenance) = self.maintenance.take() {
            maintenance.shutdown().await;
        }
        if let Some(engine) = &self.sync {
            engine.close().await;
        }

        if !self.db.health_check().await {
            warn!("Store unhealthy at shutdown");
        }
        self.db.close().await;
        info!("Gateway shutdown complete");
    }
}
