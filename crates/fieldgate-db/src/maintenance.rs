//! # Store Maintenance
//!
//! Retention cleanup, online backup and storage statistics.
//!
//! ## Retention Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  cleanup(days)        cutoff = now - days                               │
//! │                                                                         │
//! │  energy_readings      timestamp  < cutoff                 → deleted     │
//! │  ai_predictions       timestamp  < cutoff                 → deleted     │
//! │  alerts               timestamp  < cutoff, not critical   → deleted     │
//! │  sync_outbox          created_at < cutoff, synced only    → deleted     │
//! │                                                                         │
//! │  Pending, failed and conflict outbox entries are never removed.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backup
//! `VACUUM INTO` writes a consistent snapshot while other connections keep
//! writing; the snapshot is then optionally gzip-compressed.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::sync::OutboxCounts;

/// Where and how to write backups.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory receiving backup files. Created if missing.
    pub dir: PathBuf,
    /// Gzip the snapshot and drop the uncompressed copy.
    pub compress: bool,
    /// Backups older than this are pruned after a successful backup.
    pub retention_days: u32,
}

impl BackupOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BackupOptions {
            dir: dir.into(),
            compress: true,
            retention_days: 7,
        }
    }
}

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub readings: u64,
    pub predictions: u64,
    pub alerts: u64,
    pub outbox: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.readings + self.predictions + self.alerts + self.outbox
    }
}

/// Row counts and on-disk size of the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatistics {
    pub readings: i64,
    pub alerts: i64,
    pub predictions: i64,
    pub devices: i64,
    pub outbox: OutboxCounts,
    pub size_bytes: i64,
}

impl Database {
    /// Deletes data older than `retention_days`, in one transaction.
    pub async fn cleanup(&self, retention_days: u32) -> DbResult<CleanupReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut tx = self.pool().begin().await?;

        let readings = sqlx::query("DELETE FROM energy_readings WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let predictions = sqlx::query("DELETE FROM ai_predictions WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let alerts =
            sqlx::query("DELETE FROM alerts WHERE timestamp < ?1 AND severity != 'critical'")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        let outbox =
            sqlx::query("DELETE FROM sync_outbox WHERE status = 'synced' AND created_at < ?1")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;

        let report = CleanupReport {
            readings,
            predictions,
            alerts,
            outbox,
        };
        info!(
            retention_days,
            readings, predictions, alerts, outbox, "Retention cleanup complete"
        );
        Ok(report)
    }

    /// Writes a consistent snapshot of the store into `options.dir`.
    ///
    /// ## Returns
    /// Path of the backup file (`.db.gz` when compressed).
    pub async fn backup(&self, options: &BackupOptions) -> DbResult<PathBuf> {
        tokio::fs::create_dir_all(&options.dir).await?;

        let stem = backup_stem(self.path());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let snapshot = options.dir.join(format!("{stem}.backup.{stamp}.db"));

        // VACUUM INTO refuses to overwrite.
        if tokio::fs::try_exists(&snapshot).await? {
            tokio::fs::remove_file(&snapshot).await?;
        }

        sqlx::query("VACUUM INTO ?1")
            .bind(snapshot.to_string_lossy().into_owned())
            .execute(self.pool())
            .await
            .map_err(|e| DbError::BackupFailed(e.to_string()))?;

        let output = if options.compress {
            let source = snapshot.clone();
            let compressed = tokio::task::spawn_blocking(move || gzip_file(&source))
                .await
                .map_err(|e| DbError::BackupFailed(e.to_string()))??;
            tokio::fs::remove_file(&snapshot).await?;
            compressed
        } else {
            snapshot
        };

        info!(path = %output.display(), "Backup written");

        match prune_backups(&options.dir, options.retention_days).await {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "Pruned old backups"),
            Err(e) => warn!(error = %e, "Failed to prune old backups"),
        }

        Ok(output)
    }

    /// Row counts, outbox breakdown and database size.
    pub async fn statistics(&self) -> DbResult<StoreStatistics> {
        let size_bytes: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(StoreStatistics {
            readings: self.readings().count().await?,
            alerts: self.alerts().count().await?,
            predictions: self.predictions().count().await?,
            devices: self.device_status().count().await?,
            outbox: self.sync_outbox().count_by_status().await?,
            size_bytes,
        })
    }
}

/// Deletes backup files in `dir` last modified more than `retention_days` ago.
///
/// Only files containing `.backup.` are considered.
pub async fn prune_backups(dir: &Path, retention_days: u32) -> DbResult<usize> {
    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let mut removed = 0;

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().contains(".backup.") {
            continue;
        }
        let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
        if modified < cutoff {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }

    Ok(removed)
}

fn backup_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s != ":memory:")
        .unwrap_or_else(|| "fieldgate".to_string())
}

fn gzip_file(source: &Path) -> DbResult<PathBuf> {
    let mut target = source.as_os_str().to_owned();
    target.push(".gz");
    let target = PathBuf::from(target);

    let mut reader = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(&target)?), Compression::default());
    std::io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use fieldgate_core::{Alert, Reading, Severity};
    use std::io::Read;

    #[tokio::test]
    async fn test_cleanup_keeps_critical_alerts() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let old = Utc::now() - Duration::days(40);

        let mut critical = Alert::new("inv-1", "overheat", Severity::Critical, "hot");
        critical.timestamp = old;
        let mut warning = Alert::new("inv-1", "drift", Severity::Warning, "drift");
        warning.timestamp = old;
        let mut stale = Reading::new("inv-1", "inverter");
        stale.timestamp = old;
        let fresh = Reading::new("inv-1", "inverter");

        db.alerts().insert(&critical).await.unwrap();
        db.alerts().insert(&warning).await.unwrap();
        db.readings().insert(&stale).await.unwrap();
        db.readings().insert(&fresh).await.unwrap();

        let report = db.cleanup(30).await.unwrap();
        assert_eq!(report.alerts, 1);
        assert_eq!(report.readings, 1);
        // Outbox entries are fresh and still pending.
        assert_eq!(report.outbox, 0);

        assert!(db.alerts().get_by_id(&critical.id).await.unwrap().is_some());
        assert!(db.alerts().get_by_id(&warning.id).await.unwrap().is_none());
        assert!(db.readings().get_by_id(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_synced_outbox() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let synced = db.readings().insert(&Reading::new("a", "meter")).await.unwrap();
        db.readings().insert(&Reading::new("b", "meter")).await.unwrap();
        db.sync_outbox().mark_synced(synced).await.unwrap();

        // Push both entries past the cutoff.
        sqlx::query("UPDATE sync_outbox SET created_at = ?1")
            .bind(Utc::now() - Duration::days(60))
            .execute(db.pool())
            .await
            .unwrap();

        let report = db.cleanup(30).await.unwrap();
        assert_eq!(report.outbox, 1);
        assert_eq!(db.sync_outbox().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compressed_backup() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("edge.db")))
            .await
            .unwrap();
        db.readings()
            .insert(&Reading::new("inv-1", "inverter").with_power(1.0))
            .await
            .unwrap();

        let backups = dir.path().join("backups");
        let path = db.backup(&BackupOptions::new(&backups)).await.unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("edge.backup."));
        assert!(name.ends_with(".db.gz"));

        let mut header = [0u8; 2];
        File::open(&path).unwrap().read_exact(&mut header).unwrap();
        assert_eq!(header, [0x1f, 0x8b]);

        // Only the compressed copy is left behind.
        assert_eq!(std::fs::read_dir(&backups).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_plain_backup_is_openable() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("edge.db")))
            .await
            .unwrap();
        db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let options = BackupOptions {
            compress: false,
            ..BackupOptions::new(dir.path().join("backups"))
        };
        let path = db.backup(&options).await.unwrap();

        let copy = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(copy.readings().count().await.unwrap(), 1);
        assert_eq!(copy.sync_outbox().count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let stats = db.statistics().await.unwrap();
        assert_eq!(stats.readings, 1);
        assert_eq!(stats.outbox.pending, 1);
        assert!(stats.size_bytes > 0);
    }
}
