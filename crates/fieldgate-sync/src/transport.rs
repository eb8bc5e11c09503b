//! # Transport Seam
//!
//! What the engine hands to a transport, and what it gets back.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncEngine ──► Transport::send(&SyncEnvelope)                         │
//! │                     │                                                   │
//! │                     ├── Ok(Delivered)        → batch synced             │
//! │                     ├── Ok(Conflict(body))   → ConflictResolver         │
//! │                     └── Err(SyncError)       → batch failed, error text │
//! │                                                stored per record        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use fieldgate_core::{SyncTable, SYNC_SOURCE};

use crate::config::{SyncSettings, TransportKind};
use crate::error::SyncResult;
use crate::http::HttpTransport;
use crate::publish::MqttPublishTransport;

/// One batch of one table, as sent over the wire.
#[derive(Debug, Clone, Serialize)]
pub struct SyncEnvelope {
    pub table: SyncTable,
    pub data: Vec<Value>,
    pub timestamp: DateTime<Utc>,
    pub source: &'static str,
}

impl SyncEnvelope {
    pub fn new(table: SyncTable, data: Vec<Value>) -> Self {
        SyncEnvelope {
            table,
            data,
            timestamp: Utc::now(),
            source: SYNC_SOURCE,
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.len()
    }
}

/// Non-error outcome of a send.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportAck {
    Delivered,
    /// The remote side holds different state; carries its description.
    Conflict(Value),
}

/// Carries batches to the cloud.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs and status.
    fn name(&self) -> &'static str;

    async fn send(&self, envelope: &SyncEnvelope) -> SyncResult<TransportAck>;

    /// Reachability check at start. Failures are reported, never fatal.
    async fn health_check(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

/// Builds the transport selected by `settings.transport`.
pub async fn build_transport(settings: &SyncSettings) -> SyncResult<Arc<dyn Transport>> {
    settings.validate()?;
    match settings.transport {
        TransportKind::Http => Ok(Arc::new(HttpTransport::new(settings)?)),
        TransportKind::MqttPublish => Ok(Arc::new(MqttPublishTransport::start(settings)?)),
    }
}
