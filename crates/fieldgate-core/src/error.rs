//! # Core Errors
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CodecError       one register undecodable   → logged, register skipped │
//! │  ValidationError  bad config or device map   → gateway refuses to start │
//! │  CoreError        unknown enum text, or either of the above wrapped     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage failures live in `fieldgate-db` as `DbError`.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    /// A string did not name any member of a closed enumeration.
    ///
    /// ## When This Occurs
    /// - Unknown outbox status read back from storage
    /// - Unknown severity in an MQTT alert payload
    /// - Unknown table name in a sync request
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        CoreError::UnknownVariant {
            kind,
            value: value.into(),
        }
    }
}

// =============================================================================
// Codec Error
// =============================================================================

/// Register decoding errors.
///
/// Always local to one register: the caller logs it and moves on to the next
/// register of the same device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer words than the data type needs.
    ///
    /// ## When This Occurs
    /// - Device answered with a truncated frame
    /// - Register map declares `count = 1` for a 32-bit type
    #[error("{data_type} needs {needed} register(s), got {got}")]
    ShortPayload {
        data_type: &'static str,
        needed: usize,
        got: usize,
    },
}

// =============================================================================
// Validation Error
// =============================================================================

/// Raised while loading configuration; a malformed device definition never
/// reaches a polling loop.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Inclusive bounds.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// E.g. a `#` wildcard that is not the last topic level.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Two devices sharing a name.
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
