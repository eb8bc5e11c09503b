//! # fieldgate-core: Pure Domain Logic for the Fieldgate Edge Gateway
//!
//! This crate holds everything the gateway knows about its domain that does
//! not need I/O: how register words become physical quantities, how MQTT
//! topics are matched, and what the persisted entities look like.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fieldgate Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────┐          ┌──────────────────────┐            │
//! │  │ Modbus devices       │          │ MQTT devices         │            │
//! │  │ (TCP / RTU)          │          │ (pub/sub)            │            │
//! │  └──────────┬───────────┘          └──────────┬───────────┘            │
//! │             │ raw words                       │ topic + payload         │
//! │  ┌──────────▼──────────────────────────────────▼───────────────────┐   │
//! │  │               ★ fieldgate-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   codec   │  │   topic   │  │   types   │  │  device   │  │   │
//! │  │   │  decode   │  │  matches  │  │  Reading  │  │  configs  │  │   │
//! │  │   │  scaling  │  │  +  and # │  │  Outbox   │  │  reg maps │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               fieldgate-db / fieldgate-sync                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] - Register word decoding, scaling and unit lookup
//! - [`device`] - Device configuration and per-type register maps
//! - [`topic`] - MQTT wildcard matching
//! - [`types`] - Persisted domain types (Reading, Alert, OutboxRecord, ...)
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation rules
//!
//! ## Example Usage
//!
//! ```rust
//! use fieldgate_core::codec::{decode, DataType};
//!
//! assert_eq!(decode(&[0xFFFF], DataType::Int16).unwrap(), -1.0);
//! assert_eq!(decode(&[1, 0], DataType::Uint32).unwrap(), 65536.0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod codec;
pub mod device;
pub mod error;
pub mod topic;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use codec::{apply_scaling, decode, unit_for, DataType, Register, RegisterReading};
pub use device::{ConnectionConfig, DeviceConfig, DeviceType, Parity};
pub use error::{CodecError, CoreError, CoreResult, ValidationError};
pub use topic::topic_matches;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Value of the `source` field in every sync envelope.
pub const SYNC_SOURCE: &str = "edge_gateway";

/// Highest valid Modbus slave (unit) address.
pub const MAX_SLAVE_ADDRESS: u8 = 247;
