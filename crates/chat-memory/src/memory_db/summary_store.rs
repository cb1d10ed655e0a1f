//! Summary storage and retrieval operations
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::metadata::{MetadataDocument, MetadataPatch};
use crate::memory_db::metadata_merge::{EntityKind, MetadataMergeEngine};
use crate::memory_db::schema::*;
use crate::memory_db::session_store::resolve_session_uuid;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const SUMMARY_COLUMNS: &str =
    "uuid, session_uuid, content, summary_point_uuid, token_count, metadata, metadata_version, created_at";

#[derive(Clone)]
pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    merger: Arc<MetadataMergeEngine>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, merger: Arc<MetadataMergeEngine>) -> Self {
        Self { pool, merger }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().storage_context("summary store connection")
    }

    /// Store a summary anchored at `summary_point_uuid`, which must be a live
    /// message of the same session.
    pub fn create(&self, scope: &TenantScope, session_id: &str, summary: &NewSummary) -> Result<Summary> {
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?;

        let anchored: Option<i64> = conn
            .query_row(
                "SELECT id FROM messages
                 WHERE uuid = ?1 AND session_uuid = ?2 AND deleted_at IS NULL",
                params![summary.summary_point_uuid.to_string(), session_uuid.to_string()],
                |row| row.get(0),
            )
            .optional()
            .storage_context("resolve summary point")?;
        if anchored.is_none() {
            return Err(MemoryError::BadRequest(format!(
                "summary point {} is not a message of session {}",
                summary.summary_point_uuid, session_id
            )));
        }

        let uuid = Uuid::new_v4();
        let metadata = summary.metadata.clone().unwrap_or_default();
        debug!(
            "Storing summary for session {} (through message {})",
            session_id, summary.summary_point_uuid
        );
        conn.execute(
            "INSERT INTO summaries
             (uuid, session_uuid, project_uuid, summary_point_uuid, content, token_count, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid.to_string(),
                session_uuid.to_string(),
                scope.project(),
                summary.summary_point_uuid.to_string(),
                &summary.content,
                summary.token_count,
                metadata.to_json()?,
                format_timestamp(&Utc::now()),
            ],
        )
        .storage_context("create summary")?;

        drop(conn);
        self.get_by_uuid(scope, &uuid)
    }

    /// Most recently created summary of a session
    pub fn get_latest(&self, scope: &TenantScope, session_id: &str) -> Result<Option<Summary>> {
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?;
        conn.query_row(
            &format!(
                "SELECT {} FROM summaries
                 WHERE session_uuid = ?1 AND project_uuid = ?2
                 ORDER BY id DESC LIMIT 1",
                SUMMARY_COLUMNS
            ),
            params![session_uuid.to_string(), scope.project()],
            |row| Ok(row_to_summary(row)),
        )
        .optional()
        .storage_context("latest summary")?
        .transpose()
    }

    pub fn get_by_uuid(&self, scope: &TenantScope, uuid: &Uuid) -> Result<Summary> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM summaries WHERE uuid = ?1 AND project_uuid = ?2", SUMMARY_COLUMNS),
            params![uuid.to_string(), scope.project()],
            |row| Ok(row_to_summary(row)),
        )
        .optional()
        .storage_context("get summary")?
        .ok_or_else(|| MemoryError::NotFound(format!("summary {} not found", uuid)))?
    }

    /// Summaries with the given UUIDs; unknown UUIDs are skipped
    pub fn get_list_by_uuid(&self, scope: &TenantScope, uuids: &[Uuid]) -> Result<Vec<Summary>> {
        let mut summaries = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            match self.get_by_uuid(scope, uuid) {
                Ok(summary) => summaries.push(summary),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    /// One page (1-based) of a session's summaries, newest first
    pub fn list(&self, scope: &TenantScope, session_id: &str, page: i64, page_size: i64) -> Result<SummaryListResponse> {
        if page < 1 || page_size < 1 {
            return Err(MemoryError::BadRequest(format!(
                "invalid pagination: page {} size {}",
                page, page_size
            )));
        }
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?.to_string();

        let total_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM summaries WHERE session_uuid = ?1 AND project_uuid = ?2",
                params![session_uuid, scope.project()],
                |row| row.get(0),
            )
            .storage_context("count summaries")?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM summaries
                 WHERE session_uuid = ?1 AND project_uuid = ?2
                 ORDER BY id DESC LIMIT ?3 OFFSET ?4",
                SUMMARY_COLUMNS
            ))
            .storage_context("prepare list summaries")?;
        let mut rows = stmt
            .query(params![session_uuid, scope.project(), page_size, (page - 1) * page_size])
            .storage_context("list summaries")?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next().storage_context("list summaries")? {
            summaries.push(row_to_summary(row)?);
        }

        Ok(SummaryListResponse {
            row_count: summaries.len(),
            summaries,
            total_count,
        })
    }

    pub async fn update_metadata(
        &self,
        scope: &TenantScope,
        uuid: &Uuid,
        metadata: MetadataDocument,
        privileged: bool,
    ) -> Result<Summary> {
        let patch = MetadataPatch::from(metadata);
        if !patch.is_empty() {
            self.merger
                .merge_metadata(scope, EntityKind::Summary, *uuid, patch, privileged)
                .await?;
        }
        let store = self.clone();
        let (scope, uuid) = (scope.clone(), *uuid);
        tokio::task::spawn_blocking(move || store.get_by_uuid(&scope, &uuid)).await?
    }
}

fn row_to_summary(row: &Row) -> Result<Summary> {
    let uuid: String = row.get(0)?;
    let session_uuid: String = row.get(1)?;
    let point: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    Ok(Summary {
        uuid: parse_uuid(&uuid)?,
        session_uuid: parse_uuid(&session_uuid)?,
        content: row.get(2)?,
        summary_point_uuid: parse_uuid(&point)?,
        token_count: row.get(4)?,
        metadata: MetadataDocument::from_json(&metadata)?,
        metadata_version: row.get(6)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}
