//! # Maintenance Loop
//!
//! Every `backup_interval_hours`: retention cleanup, then (when enabled) an
//! online backup followed by pruning of old backups.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use fieldgate_db::{BackupOptions, CleanupReport, Database};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub cleanup: Option<CleanupReport>,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MaintenancePlan {
    pub interval: Duration,
    pub max_data_age_days: u32,
    /// `None` disables backups.
    pub backup: Option<BackupOptions>,
}

/// Runs cleanup and backup once. Failures are logged, never propagated.
pub async fn run_once(db: &Database, plan: &MaintenancePlan) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match db.cleanup(plan.max_data_age_days).await {
        Ok(cleanup) => {
            info!(
                retention_days = plan.max_data_age_days,
                removed = cleanup.total(),
                "Retention cleanup finished"
            );
            report.cleanup = Some(cleanup);
        }
        Err(e) => error!(error = %e, "Retention cleanup failed"),
    }

    if let Some(options) = &plan.backup {
        match db.backup(options).await {
            Ok(path) => report.backup = Some(path),
            Err(e) => error!(error = %e, dir = ?options.dir, "Backup failed"),
        }
    }

    report
}

/// Handle to the spawned maintenance loop.
pub struct MaintenanceLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceLoop {
    /// Spawns the loop. The first pass runs one interval after start.
    pub fn start(db: Database, plan: MaintenancePlan) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = plan.interval.as_secs(),
            backups = plan.backup.is_some(),
            "Starting maintenance loop"
        );

        let handle = tokio::spawn(async move {
            let period = plan.interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        run_once(&db, &plan).await;
                    }

                    _ = shutdown_rx.changed() => {
                        info!("Maintenance loop shutting down");
                        break;
                    }
                }
            }
        });

        MaintenanceLoop {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stops the loop, letting a running pass finish first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance loop panicked");
            }
        }
    }
}
