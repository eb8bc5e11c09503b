//! # fieldgate-ingest: Field Protocol Adapters
//!
//! Gets data off the wire and into the store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Modbus TCP/RTU ──► DevicePoller ──► db.readings().insert()           │
//! │                      (one loop per device)                              │
//! │                                                                         │
//! │   MQTT broker ────► MqttService ───► TopicRouter ──► MessageHandler    │
//! │                     (receive loop)   (spawns, never awaits)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`modbus`] - Register I/O seam, Modbus connector, device polling loops
//! - [`router`] - Wildcard handler table and non-blocking dispatch
//! - [`mqtt`] - MQTT settings, client and receive loop
//! - [`error`] - Ingest error types

pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod router;

pub use error::{IngestError, IngestResult};
pub use modbus::{
    read_device, Connector, DevicePoller, DeviceRead, ModbusConnector, ModbusStats, RegisterIo,
};
pub use mqtt::{qos_from_u8, MqttService, MqttSettings, MqttStats};
pub use router::{decode_payload, MessageHandler, TopicRouter};
