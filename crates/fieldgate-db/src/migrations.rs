//! Schema migrations, embedded from `migrations/sqlite/` at compile time.
//!
//! Applied versions are tracked by sqlx in `_sqlx_migrations`, so opening an
//! already-current store is a no-op.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Brings the schema up to the newest embedded version.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    let (total, before) = migration_status(pool).await.unwrap_or((MIGRATOR.migrations.len(), 0));
    debug!(total, applied = before, "Schema status");

    MIGRATOR.run(pool).await?;

    if before < total {
        info!(from = before, to = total, "Schema migrated");
    }
    Ok(())
}

/// `(embedded, applied)` migration counts.
///
/// Fails on a store that has never been migrated, since the tracking table
/// does not exist yet.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?;

    Ok((MIGRATOR.migrations.len(), applied as usize))
}
