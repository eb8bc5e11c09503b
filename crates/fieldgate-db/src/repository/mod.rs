//! # Repository Module
//!
//! Database repository implementations for the edge store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  Producer (poller, MQTT handler, analytics)                            │
//! │       │                                                                 │
//! │       │  db.readings().insert(&reading)                                │
//! │       ▼                                                                 │
//! │  ReadingRepository / AlertRepository / PredictionRepository            │
//! │       │   row + outbox entry, one transaction                          │
//! │       ▼                                                                 │
//! │  SyncOutboxRepository  ◄────────── sync engine reads and marks         │
//! │       │                                                                 │
//! │  SyncRecordRepository  ◄────────── sync engine hydrates / applies      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`reading::ReadingRepository`] - Energy readings
//! - [`alert::AlertRepository`] - Alerts, acknowledge / resolve
//! - [`prediction::PredictionRepository`] - Analytics output
//! - [`device_status::DeviceStatusRepository`] - Latest status per device (not synced)
//! - [`sync::SyncOutboxRepository`] - Sync queue management
//! - [`records::SyncRecordRepository`] - Table-generic hydrate / remote apply

pub mod alert;
pub mod device_status;
pub mod prediction;
pub mod reading;
pub mod records;
pub mod sync;
