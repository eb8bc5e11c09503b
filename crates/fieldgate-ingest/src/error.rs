//! # Ingest Error Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Where each error stops                              │
//! │                                                                         │
//! │  Modbus / Timeout    one register   → logged, skipped, read_errors++    │
//! │  Connection          one device     → status 'error', retried next poll │
//! │  Storage             one reading    → logged at error, poll continues   │
//! │  Mqtt                receive loop   → backoff, reconnect                │
//! │  Payload             one message    → handler error, router continues   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use fieldgate_core::ValidationError;
use fieldgate_db::DbError;
use thiserror::Error;

/// Result type alias for ingest operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Device unreachable, serial port busy, DNS failure.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Transport error or exception response for one request.
    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Inbound message could not be turned into a domain record.
    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Unknown device: {0}")]
    DeviceNotFound(String),

    #[error("Device already registered: {0}")]
    DuplicateDevice(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    /// Polling loop or receive loop has stopped.
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<rumqttc::ClientError> for IngestError {
    fn from(err: rumqttc::ClientError) -> Self {
        IngestError::Mqtt(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Payload(err.to_string())
    }
}

impl IngestError {
    /// True when the device link should be dropped and re-opened.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, IngestError::Connection(_) | IngestError::Timeout(_))
    }
}
