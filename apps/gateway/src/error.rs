//! Error types for the gateway process.

use fieldgate_core::ValidationError;
use fieldgate_db::DbError;
use fieldgate_ingest::IngestError;
use fieldgate_sync::SyncError;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Subsystem Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// True for errors caused by the configuration rather than the runtime.
    pub fn is_config_error(&self) -> bool {
        match self {
            GatewayError::ConfigRead { .. }
            | GatewayError::ConfigParse(_)
            | GatewayError::InvalidValue(_)
            | GatewayError::Validation(_) => true,
            GatewayError::Sync(e) => e.is_config_error(),
            _ => false,
        }
    }
}
