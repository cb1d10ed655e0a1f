use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::metadata::{MetadataDocument, MetadataPatch};
use crate::memory_db::metadata_merge::{EntityKind, MetadataMergeEngine};
use crate::memory_db::schema::*;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const SESSION_COLUMNS: &str = "uuid, id, session_id, user_id, project_uuid, metadata, metadata_version,
     created_at, updated_at, deleted_at, ended_at";

#[derive(Clone)]
pub struct SessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    merger: Arc<MetadataMergeEngine>,
}

impl SessionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, merger: Arc<MetadataMergeEngine>) -> Self {
        Self { pool, merger }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().storage_context("session store connection")
    }

    pub fn create(&self, scope: &TenantScope, request: &CreateSessionRequest) -> Result<Session> {
        if request.session_id.trim().is_empty() {
            return Err(MemoryError::BadRequest("session_id cannot be empty".to_string()));
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().storage_context("begin create session")?;

        if let Some(user_id) = request.user_id.as_deref() {
            ensure_user(&tx, user_id)?;
        }

        let now = format_timestamp(&Utc::now());
        let uuid = Uuid::new_v4();
        let metadata = request.metadata.clone().unwrap_or_default();
        tx.execute(
            "INSERT INTO sessions
             (uuid, session_id, user_id, project_uuid, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                uuid.to_string(),
                &request.session_id,
                request.user_id.as_deref(),
                scope.project(),
                metadata.to_json()?,
                now,
            ],
        )
        .storage_context("create session")?;
        tx.commit().storage_context("commit create session")?;
        drop(conn);

        info!("Created session {} ({})", request.session_id, uuid);
        self.get(scope, &request.session_id)
    }

    pub fn get(&self, scope: &TenantScope, session_id: &str) -> Result<Session> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions
                 WHERE project_uuid = ?1 AND session_id = ?2 AND deleted_at IS NULL",
                SESSION_COLUMNS
            ),
            params![scope.project(), session_id],
            |row| Ok(row_to_session(row)),
        )
        .optional()
        .storage_context("get session")?
        .ok_or_else(|| MemoryError::NotFound(format!("session {} not found", session_id)))?
    }

    pub fn get_by_uuid(&self, scope: &TenantScope, uuid: &Uuid) -> Result<Session> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions
                 WHERE project_uuid = ?1 AND uuid = ?2 AND deleted_at IS NULL",
                SESSION_COLUMNS
            ),
            params![scope.project(), uuid.to_string()],
            |row| Ok(row_to_session(row)),
        )
        .optional()
        .storage_context("get session by uuid")?
        .ok_or_else(|| MemoryError::NotFound(format!("session {} not found", uuid)))?
    }

    /// Column update first, then the metadata merge under the advisory lock.
    /// A failed merge does not undo the column update.
    pub async fn update(
        &self,
        scope: &TenantScope,
        request: &UpdateSessionRequest,
        privileged: bool,
    ) -> Result<Session> {
        let session = {
            let store = self.clone();
            let (scope, request) = (scope.clone(), request.clone());
            tokio::task::spawn_blocking(move || store.update_columns(&scope, &request)).await??
        };

        if let Some(metadata) = request.metadata.clone() {
            let patch = MetadataPatch::from(metadata);
            if !patch.is_empty() {
                self.merger
                    .merge_metadata(scope, EntityKind::Session, session.uuid, patch, privileged)
                    .await?;
            }
        }

        let store = self.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || store.get_by_uuid(&scope, &session.uuid)).await?
    }

    fn update_columns(&self, scope: &TenantScope, request: &UpdateSessionRequest) -> Result<Session> {
        let session = self.get(scope, &request.session_id)?;
        {
            let mut conn = self.get_conn()?;
            let tx = conn.transaction().storage_context("begin update session")?;
            if let Some(user_id) = request.user_id.as_deref() {
                ensure_user(&tx, user_id)?;
            }
            let updated = tx
                .execute(
                    "UPDATE sessions SET user_id = COALESCE(?1, user_id), updated_at = ?2
                     WHERE uuid = ?3 AND project_uuid = ?4 AND deleted_at IS NULL",
                    params![
                        request.user_id.as_deref(),
                        format_timestamp(&Utc::now()),
                        session.uuid.to_string(),
                        scope.project(),
                    ],
                )
                .storage_context("update session")?;
            if updated == 0 {
                return Err(MemoryError::NotFound(format!("session {} not found", request.session_id)));
            }
            tx.commit().storage_context("commit update session")?;
        }
        Ok(session)
    }

    /// Soft-delete the session and its messages
    pub fn delete(&self, scope: &TenantScope, session_id: &str) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().storage_context("begin delete session")?;
        let session_uuid = resolve_session_uuid(&tx, scope, session_id)?;
        let now = format_timestamp(&Utc::now());

        tx.execute(
            "UPDATE sessions SET deleted_at = ?1 WHERE uuid = ?2",
            params![now, session_uuid.to_string()],
        )
        .storage_context("delete session")?;
        let messages = tx
            .execute(
                "UPDATE messages SET deleted_at = ?1 WHERE session_uuid = ?2 AND deleted_at IS NULL",
                params![now, session_uuid.to_string()],
            )
            .storage_context("delete session messages")?;
        tx.commit().storage_context("commit delete session")?;

        info!("Deleted session {} ({} messages)", session_id, messages);
        Ok(())
    }

    /// Mark a session ended; later writes into it fail with `SessionEnded`
    pub fn end(&self, scope: &TenantScope, session_id: &str) -> Result<Session> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());
        let updated = conn
            .execute(
                "UPDATE sessions SET ended_at = COALESCE(ended_at, ?1), updated_at = ?1
                 WHERE project_uuid = ?2 AND session_id = ?3 AND deleted_at IS NULL",
                params![now, scope.project(), session_id],
            )
            .storage_context("end session")?;
        if updated == 0 {
            return Err(MemoryError::NotFound(format!("session {} not found", session_id)));
        }
        drop(conn);
        self.get(scope, session_id)
    }

    /// Keyset listing: sessions with `id > cursor`, ascending by id
    pub fn list_all(&self, scope: &TenantScope, cursor: i64, limit: usize) -> Result<Vec<Session>> {
        if cursor < 0 {
            return Err(MemoryError::BadRequest("cursor cannot be negative".to_string()));
        }
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions
                 WHERE project_uuid = ?1 AND deleted_at IS NULL AND id > ?2
                 ORDER BY id ASC LIMIT ?3",
                SESSION_COLUMNS
            ))
            .storage_context("prepare list sessions")?;
        let mut rows = stmt
            .query(params![scope.project(), cursor, limit as i64])
            .storage_context("list sessions")?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().storage_context("list sessions")? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    /// Page/size listing (1-based pages) ordered by a whitelisted column
    pub fn list_all_ordered(
        &self,
        scope: &TenantScope,
        page: i64,
        page_size: i64,
        order_by: SessionOrderBy,
        ascending: bool,
    ) -> Result<SessionListResponse> {
        if page < 1 || page_size < 1 {
            return Err(MemoryError::BadRequest(format!(
                "invalid pagination: page {} size {}",
                page, page_size
            )));
        }
        let conn = self.get_conn()?;
        let total_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE project_uuid = ?1 AND deleted_at IS NULL",
                [scope.project()],
                |row| row.get(0),
            )
            .storage_context("count sessions")?;

        let direction = if ascending { "ASC" } else { "DESC" };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions
                 WHERE project_uuid = ?1 AND deleted_at IS NULL
                 ORDER BY {} {}, id {} LIMIT ?2 OFFSET ?3",
                SESSION_COLUMNS,
                order_by.column(),
                direction,
                direction
            ))
            .storage_context("prepare list sessions ordered")?;
        let mut rows = stmt
            .query(params![scope.project(), page_size, (page - 1) * page_size])
            .storage_context("list sessions ordered")?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().storage_context("list sessions ordered")? {
            sessions.push(row_to_session(row)?);
        }

        debug!("Listed {} of {} sessions (page {})", sessions.len(), total_count, page);
        Ok(SessionListResponse {
            response_count: sessions.len(),
            sessions,
            total_count,
        })
    }
}

pub(crate) fn ensure_user(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)",
        params![user_id, format_timestamp(&Utc::now())],
    )
    .storage_context("ensure user")?;
    Ok(())
}

/// Live session's uuid for a business key, or `NotFound`
pub(crate) fn resolve_session_uuid(conn: &Connection, scope: &TenantScope, session_id: &str) -> Result<Uuid> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT uuid FROM sessions WHERE project_uuid = ?1 AND session_id = ?2 AND deleted_at IS NULL",
            params![scope.project(), session_id],
            |row| row.get(0),
        )
        .optional()
        .storage_context("resolve session")?;
    match raw {
        Some(raw) => parse_uuid(&raw),
        None => Err(MemoryError::NotFound(format!("session {} not found", session_id))),
    }
}

fn row_to_session(row: &Row) -> Result<Session> {
    let uuid: String = row.get(0)?;
    let project: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    Ok(Session {
        uuid: parse_uuid(&uuid)?,
        id: row.get(1)?,
        session_id: row.get(2)?,
        user_id: row.get(3)?,
        project_uuid: parse_uuid(&project)?,
        metadata: MetadataDocument::from_json(&metadata)?,
        metadata_version: row.get(6)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(8)?)?,
        deleted_at: parse_optional_timestamp(row.get(9)?)?,
        ended_at: parse_optional_timestamp(row.get(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::test_support::test_db;
    use serde_json::json;

    fn request(session_id: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get() {
        let (db, scope) = test_db();
        let created = db
            .sessions
            .create(
                &scope,
                &CreateSessionRequest {
                    session_id: "s1".into(),
                    user_id: Some("alice".into()),
                    metadata: Some(MetadataDocument::new().with("topic", json!("rust"))),
                },
            )
            .unwrap();
        assert_eq!(created.session_id, "s1");
        assert_eq!(created.user_id.as_deref(), Some("alice"));
        assert_eq!(created.project_uuid, scope.project_uuid);

        let fetched = db.sessions.get(&scope, "s1").unwrap();
        assert_eq!(fetched.uuid, created.uuid);
        assert_eq!(fetched.metadata.get("topic"), Some(&json!("rust")));
    }

    #[test]
    fn test_duplicate_live_session_is_bad_request() {
        let (db, scope) = test_db();
        db.sessions.create(&scope, &request("s1")).unwrap();
        let err = db.sessions.create(&scope, &request("s1")).unwrap_err();
        assert!(matches!(err, MemoryError::BadRequest(ref m) if m == "session already exists"));
    }

    #[test]
    fn test_session_id_reusable_after_delete() {
        let (db, scope) = test_db();
        db.sessions.create(&scope, &request("s1")).unwrap();
        db.sessions.delete(&scope, "s1").unwrap();
        assert!(db.sessions.get(&scope, "s1").unwrap_err().is_not_found());
        assert!(db.sessions.create(&scope, &request("s1")).is_ok());
    }

    #[test]
    fn test_projects_are_isolated() {
        let (db, scope) = test_db();
        let other = db.scope(Uuid::new_v4());
        db.sessions.create(&scope, &request("s1")).unwrap();
        assert!(db.sessions.get(&other, "s1").unwrap_err().is_not_found());
        assert!(db.sessions.create(&other, &request("s1")).is_ok());
    }

    #[test]
    fn test_end_session() {
        let (db, scope) = test_db();
        db.sessions.create(&scope, &request("s1")).unwrap();
        let ended = db.sessions.end(&scope, "s1").unwrap();
        assert!(ended.is_ended());
        assert!(db.sessions.end(&scope, "missing").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_merges_metadata() {
        let (db, scope) = test_db();
        db.sessions
            .create(
                &scope,
                &CreateSessionRequest {
                    session_id: "s1".into(),
                    user_id: None,
                    metadata: Some(MetadataDocument::new().with("a", json!(1)).with("b", json!(2))),
                },
            )
            .unwrap();

        let updated = db
            .sessions
            .update(
                &scope,
                &UpdateSessionRequest {
                    session_id: "s1".into(),
                    user_id: Some("bob".into()),
                    metadata: Some(MetadataDocument::new().with("b", json!(null)).with("c", json!(3))),
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(updated.user_id.as_deref(), Some("bob"));
        assert_eq!(updated.metadata.get("a"), Some(&json!(1)));
        assert!(!updated.metadata.contains_key("b"));
        assert_eq!(updated.metadata.get("c"), Some(&json!(3)));
        assert_eq!(updated.metadata_version, 1);
    }

    #[tokio::test]
    async fn test_update_protected_key_requires_privilege() {
        let (db, scope) = test_db();
        db.sessions.create(&scope, &request("s1")).unwrap();
        let update = UpdateSessionRequest {
            session_id: "s1".into(),
            user_id: None,
            metadata: Some(MetadataDocument::new().with("system", json!({"tier": "gold"}))),
        };
        let err = db.sessions.update(&scope, &update, false).await.unwrap_err();
        assert!(matches!(err, MemoryError::Unauthorized(_)));
        let ok = db.sessions.update(&scope, &update, true).await.unwrap();
        assert!(ok.metadata.contains_key("system"));
    }

    #[test]
    fn test_list_all_cursor() {
        let (db, scope) = test_db();
        for i in 0..5 {
            db.sessions.create(&scope, &request(&format!("s{}", i))).unwrap();
        }
        let first = db.sessions.list_all(&scope, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = db.sessions.list_all(&scope, first[1].id, 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|s| s.id > first[1].id));
        assert!(db.sessions.list_all(&scope, -1, 10).is_err());
    }

    #[test]
    fn test_list_all_ordered() {
        let (db, scope) = test_db();
        for name in ["b", "c", "a"] {
            db.sessions.create(&scope, &request(name)).unwrap();
        }
        let page = db
            .sessions
            .list_all_ordered(&scope, 1, 2, SessionOrderBy::SessionId, true)
            .unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.response_count, 2);
        let names: Vec<_> = page.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let last = db
            .sessions
            .list_all_ordered(&scope, 2, 2, SessionOrderBy::SessionId, true)
            .unwrap();
        assert_eq!(last.sessions[0].session_id, "c");

        let err = db
            .sessions
            .list_all_ordered(&scope, 0, 2, SessionOrderBy::Id, true)
            .unwrap_err();
        assert!(matches!(err, MemoryError::BadRequest(_)));
    }
}
