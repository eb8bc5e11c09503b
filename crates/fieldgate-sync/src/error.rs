//! # Sync Failures
//!
//! How a failure affects the outbox depends on where it happens:
//!
//! ```text
//!   config / url          ──► refused at startup, engine never built
//!   envelope, retryable   ──► records failed, attempts += 1, re-queued later
//!   envelope, rejected    ──► records failed, attempts += 1, left for an operator
//!   store unreachable     ──► cycle aborted, nothing marked
//! ```
//!
//! [`SyncError::is_retryable`] decides between the two envelope outcomes.
//!
//! Transport errors are stored verbatim as the outbox `error_message`, so
//! their display text is part of the observable behaviour.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Startup
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Cloud API URL missing or malformed.
    #[error("Invalid cloud URL: {0}")]
    InvalidUrl(String),

    // =========================================================================
    // Delivery
    // =========================================================================
    /// Could not reach the remote end.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request exceeded `request_timeout_secs`.
    #[error("Request timeout")]
    RequestTimeout,

    /// Non-2xx, non-409 response.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Broker link closed or the client could not queue the publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    // =========================================================================
    // Payload
    // =========================================================================
    /// Envelope could not be encoded as JSON.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Store
    // =========================================================================
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Conflict
    // =========================================================================
    /// A conflict response could not be resolved under the configured policy.
    ///
    /// ## When This Occurs
    /// - 409 body lacks a `cloud_data` array (cloud-priority, timestamp)
    /// - Applying remote values to the store failed
    #[error("Unresolvable conflict: {0}")]
    ConflictUnresolvable(String),
}

// =============================================================================
// From impls
// =============================================================================

impl From<fieldgate_db::DbError> for SyncError {
    fn from(err: fieldgate_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::RequestTimeout
        } else if err.is_connect() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_builder() {
            SyncError::InvalidConfig(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(err: rumqttc::ClientError) -> Self {
        SyncError::PublishFailed(err.to_string())
    }
}

// =============================================================================
// Classification
// =============================================================================

impl SyncError {
    /// The same batch may succeed later: unreachable peer, timeout, 5xx or
    /// 429, or a full publish queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::RequestTimeout
            | SyncError::PublishFailed(_) => true,
            SyncError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, SyncError::InvalidConfig(_) | SyncError::InvalidUrl(_))
    }
}
