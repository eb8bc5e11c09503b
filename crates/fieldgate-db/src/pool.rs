//! # Store Handle
//!
//! Opens the SQLite file, applies pragmas, runs embedded migrations and
//! hands out repositories.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Database (Clone)                              │
//! │                                                                         │
//! │   DevicePoller ──┐                                                      │
//! │   MQTT handlers ─┼──► SqlitePool (WAL, busy_timeout, foreign_keys)     │
//! │   SyncEngine ────┤        │                                             │
//! │   Maintenance ───┘        ▼                                             │
//! │                 readings │ alerts │ predictions │ device_status │ outbox│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! WAL lets the sync engine read the outbox while pollers write, and lets
//! `VACUUM INTO` snapshot the store without stopping ingestion. Concurrent
//! writers wait up to `busy_timeout` for the write lock.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::alert::AlertRepository;
use crate::repository::device_status::DeviceStatusRepository;
use crate::repository::prediction::PredictionRepository;
use crate::repository::reading::ReadingRepository;
use crate::repository::records::SyncRecordRepository;
use crate::repository::sync::SyncOutboxRepository;

const MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// How to open the store.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/fieldgate/fieldgate.db").max_connections(8);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file. Missing parent directories are created.
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free pooled connection.
    pub acquire_timeout: Duration,
    /// How long a writer waits for another writer's lock.
    pub busy_timeout: Duration,
    pub idle_timeout: Duration,
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    /// A private in-memory store. One connection, since every new
    /// connection to `:memory:` would open an empty database.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            ..DbConfig::new(MEMORY_PATH)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn is_memory(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
                .journal_mode(SqliteJournalMode::Memory)
        } else {
            SqliteConnectOptions::new()
                .filename(&self.database_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        Ok(options
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Shared handle to the store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    /// Used to name backup files.
    path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the store and migrates it.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.database_path.display(), "Opening store");

        if !config.is_memory() {
            if let Some(parent) = config.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = config.connect_options()?;
        debug!(
            busy_timeout_ms = config.busy_timeout.as_millis() as u64,
            "Connect options ready"
        );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        let db = Database {
            pool,
            path: config.database_path,
        };
        if config.run_migrations {
            db.run_migrations().await?;
        }

        info!(max_connections = config.max_connections, "Store ready");
        Ok(db)
    }

    /// Applies pending migrations. Safe to call repeatedly.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Raw pool, for statements no repository covers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// File path, or `:memory:`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Repositories
    // =========================================================================

    /// Readings. `insert` also enqueues the row for sync.
    pub fn readings(&self) -> ReadingRepository {
        ReadingRepository::new(self.pool.clone())
    }

    pub fn alerts(&self) -> AlertRepository {
        AlertRepository::new(self.pool.clone())
    }

    pub fn predictions(&self) -> PredictionRepository {
        PredictionRepository::new(self.pool.clone())
    }

    /// Latest status per device; not synced.
    pub fn device_status(&self) -> DeviceStatusRepository {
        DeviceStatusRepository::new(self.pool.clone())
    }

    pub fn sync_outbox(&self) -> SyncOutboxRepository {
        SyncOutboxRepository::new(self.pool.clone())
    }

    /// Row hydration and remote apply for the sync engine.
    pub fn records(&self) -> SyncRecordRepository {
        SyncRecordRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        info!("Closing store");
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
