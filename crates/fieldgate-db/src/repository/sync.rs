//! # Sync Outbox Repository
//!
//! Manages the sync outbox queue for store-and-forward delivery.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL WRITE (e.g., readings().insert)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO energy_readings (...)                          │   │
//! │  │                                                                 │   │
//! │  │  2. INSERT INTO sync_outbox (table_name, record_id, status)    │   │
//! │  │     VALUES ('energy_readings', ?, 'pending')                   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            SYNC ENGINE (periodic or on demand)                  │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT ... WHERE status = 'pending' ORDER BY id LIMIT n    │   │
//! │  │                                                                 │   │
//! │  │  2. Per table batch:                                           │   │
//! │  │     a. Send to cloud                                           │   │
//! │  │     b. Accepted:  status = 'synced'                            │   │
//! │  │     c. Error:     status = 'failed', attempts += 1             │   │
//! │  │     d. Unresolved conflict: status = 'conflict'                │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • A stored row always has its outbox entry (same transaction)         │
//! │  • Transitions only leave 'pending'; synced never goes back            │
//! │  • 'failed' returns to 'pending' only through requeue(), and only      │
//! │    while retryable = 1                                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use fieldgate_core::{OutboxRecord, OutboxStatus, SyncTable};

const SELECT_COLUMNS: &str = "SELECT id, table_name, record_id, status, last_attempt_at, \
     attempts, error_message, created_at FROM sync_outbox";

/// How a `failed` transition is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transmission failed and may succeed later. `attempts` + 1.
    Retryable,
    /// The remote refused the batch (e.g. HTTP 4xx). `attempts` + 1, never
    /// offered for re-queue.
    Rejected,
    /// Nothing was transmitted because the source row is gone. `attempts`
    /// unchanged, never offered for re-queue.
    Orphaned,
}

/// Outbox rows per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
    pub conflict: i64,
}

impl OutboxCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.synced + self.failed + self.conflict
    }
}

/// Repository for sync outbox operations.
#[derive(Debug, Clone)]
pub struct SyncOutboxRepository {
    pool: SqlitePool,
}

impl SyncOutboxRepository {
    /// Creates a new SyncOutboxRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncOutboxRepository { pool }
    }

    // =========================================================================
    // Enqueue (always inside the caller's transaction)
    // =========================================================================

    /// Queues a row for synchronization on the caller's connection.
    ///
    /// Call this with the same transaction that wrote the row:
    /// ```rust,ignore
    /// let mut tx = pool.begin().await?;
    /// sqlx::query("INSERT INTO alerts ...").execute(&mut *tx).await?;
    /// let outbox_id = SyncOutboxRepository::enqueue(&mut tx, SyncTable::Alerts, &alert.id).await?;
    /// tx.commit().await?;
    /// ```
    ///
    /// ## Returns
    /// The new outbox id.
    pub async fn enqueue(
        conn: &mut SqliteConnection,
        table: SyncTable,
        record_id: &str,
    ) -> DbResult<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_outbox (table_name, record_id, status, attempts, created_at) \
             VALUES (?1, ?2, 'pending', 0, ?3)",
        )
        .bind(table)
        .bind(record_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        let id = result.last_insert_rowid();
        debug!(table = %table, record_id = %record_id, outbox_id = id, "Queued for sync");
        Ok(id)
    }

    /// Queues a row unless it already has a pending entry.
    ///
    /// Used for mutations (alert acknowledged/resolved) so repeated updates
    /// before the next cycle ship the row once.
    ///
    /// ## Returns
    /// `true` when a new entry was written.
    pub async fn enqueue_if_absent(
        conn: &mut SqliteConnection,
        table: SyncTable,
        record_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT INTO sync_outbox (table_name, record_id, status, attempts, created_at) \
             SELECT ?1, ?2, 'pending', 0, ?3 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM sync_outbox \
                 WHERE table_name = ?1 AND record_id = ?2 AND status = 'pending' \
             )",
        )
        .bind(table)
        .bind(record_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Gets pending entries, oldest first.
    pub async fn get_pending(&self, limit: u32) -> DbResult<Vec<OutboxRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY id ASC LIMIT ?1");
        let records = sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Gets one entry by id.
    pub async fn get(&self, id: i64) -> DbResult<Option<OutboxRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let record = sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// All entries ever written for one row, oldest first.
    pub async fn list_for_record(
        &self,
        table: SyncTable,
        record_id: &str,
    ) -> DbResult<Vec<OutboxRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE table_name = ?1 AND record_id = ?2 ORDER BY id ASC");
        let records = sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(table)
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Retryable failed entries that still have attempts left, oldest first.
    pub async fn list_failed_retryable(&self, max_attempts: u32) -> DbResult<Vec<OutboxRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'failed' AND retryable = 1 AND attempts < ?1 ORDER BY id ASC"
        );
        let records = sqlx::query_as::<_, OutboxRecord>(&sql)
            .bind(max_attempts)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Counts pending sync entries.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_outbox WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Counts entries per status.
    pub async fn count_by_status(&self) -> DbResult<OutboxCounts> {
        let rows: Vec<(OutboxStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = OutboxCounts::default();
        for (status, n) in rows {
            match status {
                OutboxStatus::Pending => counts.pending = n,
                OutboxStatus::Synced => counts.synced = n,
                OutboxStatus::Failed => counts.failed = n,
                OutboxStatus::Conflict => counts.conflict = n,
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Marks a pending entry as synced.
    ///
    /// ## Returns
    /// `false` if the entry was not pending (nothing changed).
    pub async fn mark_synced(&self, id: i64) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        transition(&mut conn, id, OutboxStatus::Synced, None).await
    }

    /// Records a failed, retryable attempt: status `failed`, attempts + 1.
    pub async fn mark_failed(&self, id: i64, error: &str) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        fail(&mut conn, id, FailureKind::Retryable, error).await
    }

    /// Parks a pending entry as an unresolved conflict.
    pub async fn mark_conflict(&self, id: i64, reason: &str) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        transition(&mut conn, id, OutboxStatus::Conflict, Some(reason)).await
    }

    /// Marks a whole batch synced in one transaction.
    pub async fn mark_batch_synced(&self, ids: &[i64]) -> DbResult<u64> {
        self.transition_batch(ids, OutboxStatus::Synced, None).await
    }

    /// Marks a whole batch failed in one transaction.
    pub async fn mark_batch_failed(
        &self,
        ids: &[i64],
        kind: FailureKind,
        error: &str,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for id in ids {
            if fail(&mut *tx, *id, kind, error).await? {
                changed += 1;
            }
        }
        tx.commit().await?;

        debug!(kind = ?kind, requested = ids.len(), changed, "Outbox batch failed");
        Ok(changed)
    }

    /// Marks a whole batch as conflict in one transaction.
    pub async fn mark_batch_conflict(&self, ids: &[i64], reason: &str) -> DbResult<u64> {
        self.transition_batch(ids, OutboxStatus::Conflict, Some(reason)).await
    }

    /// Moves failed entries back to pending. Entries in any other state are
    /// left alone.
    ///
    /// ## Returns
    /// Number of entries re-queued.
    pub async fn requeue(&self, ids: &[i64]) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut moved = 0;
        for id in ids {
            moved += sqlx::query(
                "UPDATE sync_outbox SET status = 'pending' WHERE id = ?1 AND status = 'failed'",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        if moved > 0 {
            debug!(count = moved, "Re-queued failed outbox entries");
        }
        Ok(moved)
    }

    /// Deletes synced entries created before `older_than`.
    pub async fn purge_synced(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let result =
            sqlx::query("DELETE FROM sync_outbox WHERE status = 'synced' AND created_at < ?1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn transition_batch(
        &self,
        ids: &[i64],
        next: OutboxStatus,
        message: Option<&str>,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for id in ids {
            if transition(&mut *tx, *id, next, message).await? {
                changed += 1;
            }
        }
        tx.commit().await?;

        debug!(status = %next, requested = ids.len(), changed, "Outbox batch transitioned");
        Ok(changed)
    }
}

/// Moves one entry out of `pending` to `synced` or `conflict`. The
/// `status = 'pending'` guard keeps terminal states terminal.
async fn transition(
    conn: &mut SqliteConnection,
    id: i64,
    next: OutboxStatus,
    message: Option<&str>,
) -> DbResult<bool> {
    let result = sqlx::query(
        "UPDATE sync_outbox SET status = ?2, error_message = ?3, last_attempt_at = ?4 \
         WHERE id = ?1 AND status = 'pending'",
    )
    .bind(id)
    .bind(next)
    .bind(message)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Moves one pending entry to `failed`. Only a transmission counts as an
/// attempt.
async fn fail(
    conn: &mut SqliteConnection,
    id: i64,
    kind: FailureKind,
    error: &str,
) -> DbResult<bool> {
    let retryable = kind == FailureKind::Retryable;
    let query = match kind {
        FailureKind::Retryable | FailureKind::Rejected => sqlx::query(
            "UPDATE sync_outbox SET status = 'failed', error_message = ?2, last_attempt_at = ?3, \
             attempts = attempts + 1, retryable = ?4 WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .bind(retryable),
        FailureKind::Orphaned => sqlx::query(
            "UPDATE sync_outbox SET status = 'failed', error_message = ?2, retryable = 0 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error),
    };

    let result = query.execute(conn).await?;
    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Unit Tests
// =============================================================================
