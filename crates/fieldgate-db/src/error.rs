//! # Store Errors
//!
//! Every repository call returns [`DbResult`]. A failed insert means the
//! transaction rolled back: neither the domain row nor its outbox row exists.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sqlx::Error / MigrateError / io / serde_json                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError                                                               │
//! │       ├──► ingestion path: reading not stored, caller sees the error   │
//! │       ├──► sync cycle: aborted, records stay pending                   │
//! │       └──► maintenance: logged, retried on the next pass               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: &str = "5";

#[derive(Debug, Error)]
pub enum DbError {
    // =========================================================================
    // Lookup & Constraint Errors
    // =========================================================================
    /// No row with this id, e.g. acknowledging an unknown alert.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A UNIQUE index rejected the row (re-inserting a stored reading id).
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// A CHECK constraint rejected the row; an enum text outside the
    /// closed set reached SQLite.
    #[error("Constraint violation: {message}")]
    CheckViolation { message: String },

    // =========================================================================
    // Connection Errors
    // =========================================================================
    /// File could not be opened or created, or the pool is closed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Every pooled connection stayed busy past the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Another writer held the lock past the busy timeout.
    #[error("Database is locked")]
    Busy,

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A JSON column (`raw_data`, `metadata`, prediction payloads) could not
    /// be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// True when the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::PoolExhausted | DbError::Busy)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                if db_err.code().as_deref() == Some(SQLITE_BUSY) || msg.contains("database is locked") {
                    DbError::Busy
                } else if let Some(field) = msg.strip_prefix("UNIQUE constraint failed: ") {
                    DbError::UniqueViolation {
                        field: field.to_string(),
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("CHECK constraint failed") {
                    DbError::CheckViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            sqlx::Error::Io(e) => DbError::Io(e.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DbError::PoolExhausted.is_retryable());
        assert!(DbError::Busy.is_retryable());
        assert!(!DbError::not_found("Alert", "a1").is_retryable());
        assert!(!DbError::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert!(matches!(DbError::from(sqlx::Error::PoolTimedOut), DbError::PoolExhausted));
    }

    #[test]
    fn test_io_error_keeps_message() {
        let err: DbError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert_eq!(err.to_string(), "I/O error: read-only");
    }
}
