//! # Sync Engine
//!
//! Drains the outbox in cycles. A cycle runs on a fixed interval or on
//! demand through [`SyncEngine::sync_now`]; concurrent triggers collapse into
//! the cycle already running.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Re-queue   failed records with attempts left whose backoff expired  │
//! │  2. Fetch      up to batch_size pending records, insertion order        │
//! │  3. Group      by table                                                 │
//! │  4. Hydrate    domain rows by record id                                 │
//! │                  missing row → failed "source row missing", no attempt  │
//! │  5. Send       SyncEnvelope {table, data, timestamp, source}            │
//! │                                                                         │
//! │       Delivered ──────────────► whole batch synced                      │
//! │       Conflict(body) ─► resolve ─► ok: whole batch synced               │
//! │                                    err: whole batch conflict (terminal) │
//! │       Err(e) ─────────────────► whole batch failed, e as error text;   │
//! │                                  re-queued later only if retryable      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single-Flight
//! The first caller becomes the leader and runs the cycle; later callers
//! subscribe to the leader's `watch` channel and receive the same
//! [`SyncSummary`]. They never start a cycle of their own.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fieldgate_core::{OutboxRecord, SyncTable};
use fieldgate_db::{Database, FailureKind};

use crate::conflict::ConflictResolver;
use crate::config::SyncSettings;
use crate::error::SyncResult;
use crate::transport::{SyncEnvelope, Transport, TransportAck};

/// Error text stored on records whose domain row has disappeared.
pub const SOURCE_ROW_MISSING: &str = "source row missing";

// =============================================================================
// Summary & Status
// =============================================================================

/// Result of one cycle.
///
/// `success` is false when the cycle aborted on a storage error or any
/// record ended up failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub success: bool,
    pub records_synced: u64,
    pub records_failed: u64,
    pub conflicts_resolved: u64,
    pub conflicts_unresolved: u64,
    pub requeued: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl SyncSummary {
    fn aborted() -> Self {
        SyncSummary {
            success: false,
            error: Some("sync cycle aborted".to_string()),
            ..SyncSummary::default()
        }
    }
}

/// Engine state for status queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub transport: String,
    pub syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_count: i64,
    pub total_synced: u64,
    pub total_failed: u64,
    pub conflicts_resolved: u64,
    pub conflicts_unresolved: u64,
    pub requeued: u64,
    /// Cycles that aborted on a storage error.
    pub sync_errors: u64,
    pub cycles: u64,
}

#[derive(Debug, Default)]
struct EngineStats {
    syncing: bool,
    last_sync_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    total_synced: u64,
    total_failed: u64,
    conflicts_resolved: u64,
    conflicts_unresolved: u64,
    requeued: u64,
    sync_errors: u64,
    cycles: u64,
}

// =============================================================================
// Sync Engine
// =============================================================================

type InFlight = StdMutex<Option<watch::Receiver<Option<SyncSummary>>>>;

struct EngineInner {
    db: Database,
    settings: SyncSettings,
    transport: Arc<dyn Transport>,
    resolver: ConflictResolver,
    stats: RwLock<EngineStats>,
    in_flight: InFlight,
}

/// Outbox-draining engine. Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

enum Role {
    Leader(watch::Sender<Option<SyncSummary>>),
    Follower(watch::Receiver<Option<SyncSummary>>),
}

/// Clears the in-flight slot when the leader finishes or is cancelled.
struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl SyncEngine {
    pub fn new(db: Database, settings: SyncSettings, transport: Arc<dyn Transport>) -> Self {
        let resolver = ConflictResolver::new(settings.conflict_resolution, db.clone());
        SyncEngine {
            inner: Arc::new(EngineInner {
                db,
                settings,
                transport,
                resolver,
                stats: RwLock::new(EngineStats::default()),
                in_flight: StdMutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Runs one cycle, or waits for the one in flight and returns its summary.
    pub async fn sync_now(&self) -> SyncSummary {
        let role = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!("Sync cycle already running, waiting for its result");
                match rx.wait_for(Option::is_some).await {
                    Ok(summary) => summary.as_ref().cloned().unwrap_or_else(SyncSummary::aborted),
                    Err(_) => SyncSummary::aborted(),
                }
            }
            Role::Leader(tx) => {
                let summary = {
                    let _guard = InFlightGuard(&self.inner.in_flight);
                    self.inner.run_cycle().await
                };
                let _ = tx.send(Some(summary.clone()));
                summary
            }
        }
    }

    /// Current counters plus the live pending count.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let pending_count = self.inner.db.sync_outbox().count_pending().await?;
        let stats = self.inner.stats.read().await;

        Ok(SyncStatus {
            enabled: self.inner.settings.enabled,
            transport: self.inner.transport.name().to_string(),
            syncing: stats.syncing,
            last_sync_time: stats.last_sync_time,
            last_error: stats.last_error.clone(),
            pending_count,
            total_synced: stats.total_synced,
            total_failed: stats.total_failed,
            conflicts_resolved: stats.conflicts_resolved,
            conflicts_unresolved: stats.conflicts_unresolved,
            requeued: stats.requeued,
            sync_errors: stats.sync_errors,
            cycles: stats.cycles,
        })
    }

    /// Checks the transport is reachable and spawns the periodic loop.
    ///
    /// The first periodic cycle runs one interval after start.
    pub async fn start(&self) -> SyncLoop {
        if let Err(e) = self.inner.transport.health_check().await {
            warn!(transport = self.inner.transport.name(), error = %e, "Transport health check failed");
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.inner.settings.interval();

        info!(
            interval_secs = period.as_secs(),
            batch_size = self.inner.settings.batch_size,
            transport = self.inner.transport.name(),
            policy = %self.inner.settings.conflict_resolution,
            "Starting sync loop"
        );

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let summary = engine.sync_now().await;
                        if !summary.success {
                            debug!(error = ?summary.error, "Periodic sync cycle incomplete");
                        }
                    }

                    _ = shutdown_rx.changed() => {
                        info!("Sync loop shutting down");
                        break;
                    }
                }
            }
        });

        SyncLoop {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Releases the transport.
    pub async fn close(&self) {
        self.inner.transport.close().await;
    }
}

/// Handle to the periodic loop.
pub struct SyncLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SyncLoop {
    /// Stops the loop, letting a running cycle finish first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync loop panicked");
            }
        }
    }
}

// =============================================================================
// Cycle
// =============================================================================

#[derive(Debug, Default)]
struct CycleCounts {
    synced: u64,
    failed: u64,
    resolved: u64,
    unresolved: u64,
    requeued: u64,
}

impl EngineInner {
    async fn run_cycle(&self) -> SyncSummary {
        let started = Instant::now();
        self.stats.write().await.syncing = true;

        let mut counts = CycleCounts::default();
        let result = self.cycle(&mut counts).await;

        let mut stats = self.stats.write().await;
        stats.syncing = false;
        stats.cycles += 1;
        stats.total_synced += counts.synced;
        stats.total_failed += counts.failed;
        stats.conflicts_resolved += counts.resolved;
        stats.conflicts_unresolved += counts.unresolved;
        stats.requeued += counts.requeued;

        let error = match result {
            Ok(()) => {
                stats.last_sync_time = Some(Utc::now());
                None
            }
            Err(e) => {
                error!(error = %e, "Sync cycle aborted");
                stats.sync_errors += 1;
                Some(e.to_string())
            }
        };
        if error.is_some() {
            stats.last_error = error.clone();
        }

        let summary = SyncSummary {
            success: error.is_none() && counts.failed == 0,
            records_synced: counts.synced,
            records_failed: counts.failed,
            conflicts_resolved: counts.resolved,
            conflicts_unresolved: counts.unresolved,
            requeued: counts.requeued,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };
        if summary.records_synced + summary.records_failed + summary.conflicts_unresolved > 0 {
            info!(
                synced = summary.records_synced,
                failed = summary.records_failed,
                conflicts_resolved = summary.conflicts_resolved,
                conflicts_unresolved = summary.conflicts_unresolved,
                duration_ms = summary.duration_ms,
                "Sync cycle complete"
            );
        }
        summary
    }

    async fn cycle(&self, counts: &mut CycleCounts) -> SyncResult<()> {
        counts.requeued = self.requeue_due().await?;

        let pending = self
            .db
            .sync_outbox()
            .get_pending(self.settings.batch_size)
            .await?;
        if pending.is_empty() {
            debug!("No pending outbox records");
            return Ok(());
        }

        let mut groups: BTreeMap<SyncTable, Vec<OutboxRecord>> = BTreeMap::new();
        for record in pending {
            groups.entry(record.table_name).or_default().push(record);
        }

        for (table, records) in groups {
            self.sync_group(table, records, counts).await?;
        }
        Ok(())
    }

    /// Moves failed records back to pending once their backoff has expired.
    async fn requeue_due(&self) -> SyncResult<u64> {
        let candidates = self
            .db
            .sync_outbox()
            .list_failed_retryable(self.settings.retry_attempts)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let due: Vec<i64> = candidates
            .iter()
            .filter(|record| match record.last_attempt_at {
                Some(at) => (now - at)
                    .to_std()
                    .map(|elapsed| elapsed >= self.settings.retry_delay(record.attempts))
                    .unwrap_or(false),
                None => true,
            })
            .map(|record| record.id)
            .collect();

        if due.is_empty() {
            return Ok(0);
        }
        Ok(self.db.sync_outbox().requeue(&due).await?)
    }

    async fn sync_group(
        &self,
        table: SyncTable,
        records: Vec<OutboxRecord>,
        counts: &mut CycleCounts,
    ) -> SyncResult<()> {
        let record_ids: Vec<String> = records.iter().map(|r| r.record_id.clone()).collect();
        let rows = self.db.records().hydrate(table, &record_ids).await?;

        let (present, missing): (Vec<OutboxRecord>, Vec<OutboxRecord>) = records
            .into_iter()
            .partition(|r| rows.contains_key(&r.record_id));

        if !missing.is_empty() {
            let ids: Vec<i64> = missing.iter().map(|r| r.id).collect();
            warn!(table = %table, count = ids.len(), "Outbox records without source row");
            counts.failed += self
                .db
                .sync_outbox()
                .mark_batch_failed(&ids, FailureKind::Orphaned, SOURCE_ROW_MISSING)
                .await?;
        }
        if present.is_empty() {
            return Ok(());
        }

        let outbox_ids: Vec<i64> = present.iter().map(|r| r.id).collect();
        let data: Vec<Value> = present
            .iter()
            .filter_map(|r| rows.get(&r.record_id).cloned())
            .collect();
        let sent: HashMap<String, Value> = present
            .iter()
            .filter_map(|r| rows.get(&r.record_id).map(|row| (r.record_id.clone(), row.clone())))
            .collect();
        let envelope = SyncEnvelope::new(table, data);

        debug!(
            table = %table,
            records = envelope.record_count(),
            transport = self.transport.name(),
            "Sending sync batch"
        );

        match self.transport.send(&envelope).await {
            Ok(TransportAck::Delivered) => {
                counts.synced += self.db.sync_outbox().mark_batch_synced(&outbox_ids).await?;
            }

            Ok(TransportAck::Conflict(body)) => {
                match self.resolver.resolve(table, &sent, &body).await {
                    Ok(_) => {
                        counts.resolved += self.db.sync_outbox().mark_batch_synced(&outbox_ids).await?;
                    }
                    Err(e) => {
                        warn!(table = %table, error = %e, "Conflict left unresolved");
                        counts.unresolved += self
                            .db
                            .sync_outbox()
                            .mark_batch_conflict(&outbox_ids, &e.to_string())
                            .await?;
                    }
                }
            }

            Err(e) => {
                let kind = if e.is_retryable() {
                    FailureKind::Retryable
                } else {
                    FailureKind::Rejected
                };
                warn!(
                    table = %table,
                    records = outbox_ids.len(),
                    kind = ?kind,
                    error = %e,
                    "Sync batch failed"
                );
                counts.failed += self
                    .db
                    .sync_outbox()
                    .mark_batch_failed(&outbox_ids, kind, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictPolicy;
    use crate::error::SyncError;
    use async_trait::async_trait;
    use fieldgate_core::{Alert, OutboxStatus, Reading, Severity};
    use fieldgate_db::DbConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    enum Reply {
        Ok,
        Conflict(Value),
        Fail(u16),
    }

    /// Counts sends, optionally stalls, and answers with a fixed reply.
    struct StubTransport {
        reply: StdMutex<Reply>,
        delay: Duration,
        sends: AtomicUsize,
        envelopes: StdMutex<Vec<SyncEnvelope>>,
    }

    impl StubTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Self::slow(reply, Duration::ZERO)
        }

        fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(StubTransport {
                reply: StdMutex::new(reply),
                delay,
                sends: AtomicUsize::new(0),
                envelopes: StdMutex::new(Vec::new()),
            })
        }

        fn set_reply(&self, reply: Reply) {
            *self.reply.lock().unwrap() = reply;
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn send(&self, envelope: &SyncEnvelope) -> SyncResult<TransportAck> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.envelopes.lock().unwrap().push(envelope.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = self.reply.lock().unwrap().clone();
            match reply {
                Reply::Ok => Ok(TransportAck::Delivered),
                Reply::Conflict(body) => Ok(TransportAck::Conflict(body)),
                Reply::Fail(status) => Err(SyncError::HttpStatus {
                    status,
                    body: "boom".into(),
                }),
            }
        }
    }

    async fn engine_with(
        transport: Arc<StubTransport>,
        settings: SyncSettings,
    ) -> (Database, SyncEngine) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::new(db.clone(), settings, transport);
        (db, engine)
    }

    #[tokio::test]
    async fn test_end_to_end_single_reading() {
        let transport = StubTransport::new(Reply::Ok);
        let (db, engine) = engine_with(transport.clone(), SyncSettings::default()).await;

        let reading = Reading::new("inv-1", "inverter").with_power(120.5);
        db.readings().insert(&reading).await.unwrap();
        assert_eq!(engine.status().await.unwrap().pending_count, 1);

        let summary = engine.sync_now().await;
        assert!(summary.success);
        assert_eq!(summary.records_synced, 1);

        let status = engine.status().await.unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.total_synced, 1);
        assert!(status.last_sync_time.is_some());
        assert!(!status.syncing);

        let envelopes = transport.envelopes.lock().unwrap();
        assert_eq!(envelopes[0].table, SyncTable::EnergyReadings);
        assert_eq!(envelopes[0].data[0]["power"], 120.5);
        assert_eq!(envelopes[0].data[0]["device_id"], "inv-1");
    }

    #[tokio::test]
    async fn test_groups_by_table_in_insertion_order() {
        let transport = StubTransport::new(Reply::Ok);
        let (db, engine) = engine_with(transport.clone(), SyncSettings::default()).await;

        let first = Reading::new("a", "meter");
        let second = Reading::new("b", "meter");
        db.readings().insert(&first).await.unwrap();
        db.alerts()
            .insert(&Alert::new("a", "overheat", Severity::Warning, "hot"))
            .await
            .unwrap();
        db.readings().insert(&second).await.unwrap();

        let summary = engine.sync_now().await;
        assert_eq!(summary.records_synced, 3);
        assert_eq!(transport.sends(), 2);

        let envelopes = transport.envelopes.lock().unwrap();
        let readings = envelopes
            .iter()
            .find(|e| e.table == SyncTable::EnergyReadings)
            .unwrap();
        assert_eq!(readings.data[0]["id"], first.id.as_str());
        assert_eq!(readings.data[1]["id"], second.id.as_str());
    }

    #[tokio::test]
    async fn test_concurrent_sync_now_sends_once() {
        let transport = StubTransport::slow(Reply::Ok, Duration::from_millis(200));
        let (db, engine) = engine_with(transport.clone(), SyncSettings::default()).await;
        db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let (a, b) = tokio::join!(engine.sync_now(), engine.sync_now());
        assert_eq!(transport.sends(), 1);
        assert_eq!(a, b);
        assert_eq!(a.records_synced, 1);
        assert_eq!(engine.status().await.unwrap().cycles, 1);

        // The slot is free again afterwards.
        db.readings().insert(&Reading::new("inv-2", "inverter")).await.unwrap();
        engine.sync_now().await;
        assert_eq!(transport.sends(), 2);
    }

    #[tokio::test]
    async fn test_failure_marks_batch_and_keeps_error_text() {
        let transport = StubTransport::new(Reply::Fail(500));
        let (db, engine) = engine_with(transport, SyncSettings::default()).await;
        let outbox_id = db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let summary = engine.sync_now().await;
        assert!(!summary.success);
        assert_eq!(summary.records_failed, 1);

        let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("HTTP 500: boom"));
        assert_eq!(record.attempts, 1);
        assert_eq!(engine.status().await.unwrap().total_failed, 1);
    }

    #[tokio::test]
    async fn test_failed_records_retry_after_backoff() {
        let transport = StubTransport::new(Reply::Fail(503));
        let settings = SyncSettings {
            retry_attempts: 2,
            retry_delay_secs: 0,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport.clone(), settings).await;
        let outbox_id = db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        engine.sync_now().await;
        transport.set_reply(Reply::Ok);
        let summary = engine.sync_now().await;

        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.records_synced, 1);
        let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Synced);
    }

    #[tokio::test]
    async fn test_retry_limit_and_delay_respected() {
        let transport = StubTransport::new(Reply::Fail(503));
        let settings = SyncSettings {
            retry_attempts: 1,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport.clone(), settings).await;
        db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        engine.sync_now().await;
        let summary = engine.sync_now().await;
        assert_eq!(summary.requeued, 0);
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_row_fails_record() {
        let transport = StubTransport::new(Reply::Ok);
        let (db, engine) = engine_with(transport.clone(), SyncSettings::default()).await;
        let reading = Reading::new("inv-1", "inverter");
        let outbox_id = db.readings().insert(&reading).await.unwrap();

        sqlx::query("DELETE FROM energy_readings WHERE id = ?1")
            .bind(&reading.id)
            .execute(db.pool())
            .await
            .unwrap();

        let summary = engine.sync_now().await;
        assert_eq!(summary.records_failed, 1);
        assert_eq!(transport.sends(), 0);

        let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some(SOURCE_ROW_MISSING));
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_not_retried() {
        let transport = StubTransport::new(Reply::Fail(400));
        let settings = SyncSettings {
            retry_attempts: 3,
            retry_delay_secs: 0,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport.clone(), settings).await;
        let outbox_id = db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        engine.sync_now().await;
        transport.set_reply(Reply::Ok);
        let summary = engine.sync_now().await;

        assert_eq!(summary.requeued, 0);
        assert_eq!(transport.sends(), 1);
        let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("HTTP 400: boom"));
    }

    #[tokio::test]
    async fn test_conflict_resolved_under_each_policy() {
        for policy in [
            ConflictPolicy::EdgePriority,
            ConflictPolicy::CloudPriority,
            ConflictPolicy::Timestamp,
        ] {
            let transport = StubTransport::new(Reply::Ok);
            let settings = SyncSettings {
                conflict_resolution: policy,
                ..SyncSettings::default()
            };
            let (db, engine) = engine_with(transport.clone(), settings).await;

            let reading = Reading::new("inv-1", "inverter").with_power(10.0);
            let outbox_id = db.readings().insert(&reading).await.unwrap();
            let newer = (reading.timestamp + chrono::Duration::seconds(30)).to_rfc3339();
            transport.set_reply(Reply::Conflict(json!({
                "cloud_data": [{"id": reading.id, "power": 20.0, "timestamp": newer}]
            })));

            let summary = engine.sync_now().await;
            assert!(summary.success, "{policy}");
            assert_eq!(summary.conflicts_resolved, 1, "{policy}");

            let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
            assert_eq!(record.status, OutboxStatus::Synced, "{policy}");

            let power = db.readings().get_by_id(&reading.id).await.unwrap().unwrap().power;
            let expected = match policy {
                ConflictPolicy::EdgePriority => 10.0,
                ConflictPolicy::CloudPriority | ConflictPolicy::Timestamp => 20.0,
            };
            assert_eq!(power, Some(expected), "{policy}");
            assert_eq!(engine.status().await.unwrap().conflicts_resolved, 1);
        }
    }

    #[tokio::test]
    async fn test_unresolvable_conflict_is_terminal() {
        let transport = StubTransport::new(Reply::Conflict(json!({"error": "stale"})));
        let settings = SyncSettings {
            conflict_resolution: ConflictPolicy::CloudPriority,
            retry_delay_secs: 0,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport.clone(), settings).await;
        let outbox_id = db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let summary = engine.sync_now().await;
        assert_eq!(summary.conflicts_unresolved, 1);

        let record = db.sync_outbox().get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Conflict);

        // Never picked up again.
        engine.sync_now().await;
        assert_eq!(transport.sends(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_caps_fetch() {
        let transport = StubTransport::new(Reply::Ok);
        let settings = SyncSettings {
            batch_size: 2,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport, settings).await;
        for i in 0..3 {
            db.readings()
                .insert(&Reading::new(format!("d{i}"), "meter"))
                .await
                .unwrap();
        }

        assert_eq!(engine.sync_now().await.records_synced, 2);
        assert_eq!(engine.status().await.unwrap().pending_count, 1);
        assert_eq!(engine.sync_now().await.records_synced, 1);
    }

    #[tokio::test]
    async fn test_periodic_loop_runs_and_drains() {
        let transport = StubTransport::new(Reply::Ok);
        let settings = SyncSettings {
            interval_secs: 1,
            ..SyncSettings::default()
        };
        let (db, engine) = engine_with(transport.clone(), settings).await;
        db.readings().insert(&Reading::new("inv-1", "inverter")).await.unwrap();

        let sync_loop = engine.start().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        sync_loop.shutdown().await;

        assert_eq!(transport.sends(), 1);
        assert_eq!(engine.status().await.unwrap().pending_count, 0);
    }
}
