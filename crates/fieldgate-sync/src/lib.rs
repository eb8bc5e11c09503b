//! # fieldgate-sync: Outbox Sync Engine
//!
//! Moves outbox records from `pending` to a final state by shipping the rows
//! they point at to the cloud.
//!
//! ## Sync Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Edge Gateway                                   │
//! │                                                                         │
//! │   ┌──────────────┐   pending    ┌──────────────┐  envelope  ┌────────┐  │
//! │   │ sync_outbox  │ ───────────► │  SyncEngine  │ ─────────► │Transport│ │
//! │   │ (SQLite)     │ ◄─────────── │ single-flight│ ◄───────── │HTTP/MQTT│ │
//! │   └──────────────┘  synced /    └──────┬───────┘  ack /     └────────┘  │
//! │                     failed /           │          409 / err             │
//! │                     conflict           ▼                                │
//! │                              ┌──────────────────┐                       │
//! │                              │ ConflictResolver │ edge | cloud | time   │
//! │                              └──────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//! - [`engine`] - Cycles, single-flight guard, periodic loop, status
//! - [`transport`] - Transport trait, envelope, transport factory
//! - [`http`] - reqwest transport
//! - [`publish`] - MQTT message-publish transport
//! - [`conflict`] - 409 resolution policies
//! - [`config`] - `[sync]` settings
//! - [`error`] - Error types

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod http;
pub mod publish;
pub mod transport;

pub use config::{ConflictPolicy, PublishSettings, SyncSettings, TransportKind};
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{SyncEngine, SyncLoop, SyncStatus, SyncSummary};
pub use error::{SyncError, SyncResult};
pub use http::HttpTransport;
pub use publish::MqttPublishTransport;
pub use transport::{build_transport, SyncEnvelope, Transport, TransportAck};
