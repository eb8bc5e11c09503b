//! # Fieldgate Gateway
//!
//! Edge gateway daemon: collects field-device data into the local store
//! and drains it to the cloud.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Gateway Process                                 │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────────┐│
//! │  │  Ingestion     │  │  Store         │  │  Sync                      ││
//! │  │                │  │                │  │                            ││
//! │  │ • Modbus poll  │─►│ • domain rows  │─►│ • single-flight cycles     ││
//! │  │ • MQTT topics  │  │ • sync_outbox  │  │ • HTTP / MQTT publish      ││
//! │  │                │  │ • cleanup      │  │ • conflict policies        ││
//! │  └────────────────┘  │ • backups      │  └────────────────────────────┘│
//! │                      └────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! See [`config`]. Environment variables:
//! - `FIELDGATE_CONFIG` - Path of the TOML config file
//! - `FIELDGATE_DATABASE_PATH` - SQLite file
//! - `FIELDGATE_CLOUD_API_URL` / `FIELDGATE_CLOUD_API_KEY` - Sync endpoint
//! - `FIELDGATE_MQTT_HOST` / `FIELDGATE_MQTT_PORT` - Broker
//! - `RUST_LOG` - Log filter (default: `info,fieldgate=debug,sqlx=warn`)

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod maintenance;

// Re-exports
pub use config::GatewayConfig;
pub use context::{GatewayContext, GatewayStatus};
pub use error::{GatewayError, GatewayResult};

use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,fieldgate=debug,sqlx=warn";

/// Installs the global tracing subscriber. Call once, from `main`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
