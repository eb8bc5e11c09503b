//! # fieldgate-db: Local Durable Store
//!
//! SQLite-backed single source of truth for the edge gateway.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Modbus poll / MQTT handler / analytics                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  db.readings().insert(&reading)                                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────── ONE TRANSACTION ───────────────────────┐     │
//! │  │  INSERT INTO energy_readings (...)                            │     │
//! │  │  INSERT INTO sync_outbox (table_name, record_id, 'pending')   │     │
//! │  └───────────────────────────────────────────────────────────────┘     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Sync engine drains sync_outbox later                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! let db = Database::new(DbConfig::new("./fieldgate.db")).await?;
//! let outbox_id = db.readings().insert(&reading).await?;
//! let pending = db.sync_outbox().get_pending(100).await?;
//! ```

pub mod error;
pub mod maintenance;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use maintenance::{BackupOptions, CleanupReport, StoreStatistics};
pub use pool::{Database, DbConfig};
pub use repository::alert::{AlertFilter, AlertRepository};
pub use repository::device_status::DeviceStatusRepository;
pub use repository::prediction::PredictionRepository;
pub use repository::reading::{ReadingFilter, ReadingRepository};
pub use repository::records::SyncRecordRepository;
pub use repository::sync::{FailureKind, OutboxCounts, SyncOutboxRepository};
