//! Hard-deletion of soft-deleted rows past the retention window
use crate::error::{Result, StorageContext};
use crate::memory_db::schema::{format_timestamp, PurgeStats, TenantScope};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::sync::Arc;
use tracing::info;

pub struct PurgeEngine {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl PurgeEngine {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    /// Delete rows of `scope` whose `deleted_at` is older than `cutoff`.
    /// Embeddings go with their messages and sessions. Summaries go only with
    /// their session: a message some summary is anchored on stays until the
    /// session itself is purged.
    pub fn purge_deleted(&self, scope: &TenantScope, cutoff: DateTime<Utc>) -> Result<PurgeStats> {
        let mut conn = self.pool.get().storage_context("purge connection")?;
        let tx = conn.transaction().storage_context("begin purge")?;
        let cutoff = format_timestamp(&cutoff);

        let messages = tx
            .execute(
                "DELETE FROM messages
                 WHERE project_uuid = ?1 AND deleted_at IS NOT NULL AND deleted_at < ?2
                   AND uuid NOT IN (SELECT summary_point_uuid FROM summaries)",
                params![scope.project(), cutoff],
            )
            .storage_context("purge messages")?;
        let sessions = tx
            .execute(
                "DELETE FROM sessions
                 WHERE project_uuid = ?1 AND deleted_at IS NOT NULL AND deleted_at < ?2",
                params![scope.project(), cutoff],
            )
            .storage_context("purge sessions")?;
        tx.commit().storage_context("commit purge")?;

        if sessions > 0 || messages > 0 {
            info!(
                "Purged {} sessions and {} messages from {} (project {})",
                sessions, messages, scope.schema, scope.project_uuid
            );
        }
        Ok(PurgeStats { sessions, messages })
    }
}
