//! Lock-guarded read-merge-write of metadata documents
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::advisory_lock::{self, LockKey, LockPolicy, NamedMutex};
use crate::memory_db::metadata::{self, MetadataDocument, MetadataPatch};
use crate::memory_db::schema::{format_timestamp, TenantScope};
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Session,
    Message,
    Summary,
}

impl EntityKind {
    fn table(&self) -> &'static str {
        match self {
            EntityKind::Session => "sessions",
            EntityKind::Message => "messages",
            EntityKind::Summary => "summaries",
        }
    }

    fn live_filter(&self) -> &'static str {
        match self {
            EntityKind::Summary => "",
            _ => " AND deleted_at IS NULL",
        }
    }

    fn touches_updated_at(&self) -> bool {
        !matches!(self, EntityKind::Summary)
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub metadata: MetadataDocument,
    pub version: i64,
}

#[derive(Clone)]
pub struct MetadataMergeEngine {
    pool: Arc<Pool<SqliteConnectionManager>>,
    mutex: Arc<dyn NamedMutex>,
    policy: LockPolicy,
}

impl MetadataMergeEngine {
    pub fn new(
        pool: Arc<Pool<SqliteConnectionManager>>,
        mutex: Arc<dyn NamedMutex>,
        policy: LockPolicy,
    ) -> Self {
        Self { pool, mutex, policy }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Merge `patch` into the stored document of `entity`.
    ///
    /// The advisory lock keyed by `entity` is held only between the read and
    /// the write; it is released on every exit path.
    pub async fn merge_metadata(
        &self,
        scope: &TenantScope,
        kind: EntityKind,
        entity: Uuid,
        patch: MetadataPatch,
        privileged: bool,
    ) -> Result<MergeOutcome> {
        if !privileged && !patch.protected_keys().is_empty() {
            // reject before contending for the lock
            return Err(MemoryError::Unauthorized(format!(
                "metadata keys {:?} are reserved",
                patch.protected_keys()
            )));
        }

        let key = LockKey::for_entity(&entity);
        let guard = advisory_lock::acquire(Arc::clone(&self.mutex), key, &self.policy).await?;

        let keys = patch.len();
        let engine = self.clone();
        let scope = scope.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.merge_locked(&scope, kind, entity, &patch, privileged))
            .await??;

        if let Err(e) = guard.release() {
            warn!("Metadata merged for {} but lock release failed: {}", entity, e);
        }
        debug!(
            "Merged {} metadata key(s) into {} {} (version {})",
            keys,
            kind.table(),
            entity,
            outcome.version
        );
        Ok(outcome)
    }

    fn merge_locked(
        &self,
        scope: &TenantScope,
        kind: EntityKind,
        entity: Uuid,
        patch: &MetadataPatch,
        privileged: bool,
    ) -> Result<MergeOutcome> {
        let conn = self.pool.get().storage_context("metadata merge connection")?;
        let table = kind.table();

        let current: Option<(String, i64)> = conn
            .query_row(
                &format!(
                    "SELECT metadata, metadata_version FROM {} WHERE uuid = ?1 AND project_uuid = ?2{}",
                    table,
                    kind.live_filter()
                ),
                params![entity.to_string(), scope.project()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .storage_context("read metadata")?;

        let (raw, version) = current
            .ok_or_else(|| MemoryError::NotFound(format!("{} {} not found", table, entity)))?;
        let merged = metadata::merge(&MetadataDocument::from_json(&raw)?, patch, privileged)?;

        let sql = if kind.touches_updated_at() {
            format!(
                "UPDATE {} SET metadata = ?1, metadata_version = metadata_version + 1, updated_at = ?4
                 WHERE uuid = ?2 AND project_uuid = ?3",
                table
            )
        } else {
            format!(
                "UPDATE {} SET metadata = ?1, metadata_version = metadata_version + 1
                 WHERE uuid = ?2 AND project_uuid = ?3",
                table
            )
        };
        let json = merged.to_json()?;
        let now = format_timestamp(&Utc::now());
        let updated = if kind.touches_updated_at() {
            conn.execute(&sql, params![json, entity.to_string(), scope.project(), now])
        } else {
            conn.execute(&sql, params![json, entity.to_string(), scope.project()])
        }
        .storage_context("write metadata")?;

        if updated == 0 {
            return Err(MemoryError::NotFound(format!("{} {} not found", table, entity)));
        }
        Ok(MergeOutcome { metadata: merged, version: version + 1 })
    }
}
