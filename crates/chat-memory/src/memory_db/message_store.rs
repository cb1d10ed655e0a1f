//! Message persistence: ordered windows, pages and two-phase updates
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::metadata::{MetadataDocument, MetadataPatch};
use crate::memory_db::metadata_merge::{EntityKind, MetadataMergeEngine};
use crate::memory_db::schema::*;
use crate::memory_db::session_store::resolve_session_uuid;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "uuid, id, session_id, project_uuid, role, role_type, content, token_count,
     metadata, metadata_version, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct MessageStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    merger: Arc<MetadataMergeEngine>,
}

impl MessageStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, merger: Arc<MetadataMergeEngine>) -> Self {
        Self { pool, merger }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().storage_context("message store connection")
    }

    /// Insert a batch in one transaction. A colliding UUID fails the whole batch.
    pub fn create_many(
        &self,
        scope: &TenantScope,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().storage_context("begin create messages")?;
        let session_uuid = writable_session(&tx, scope, session_id)?;

        let now = format_timestamp(&Utc::now());
        let mut uuids = Vec::with_capacity(messages.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO messages
                     (uuid, session_uuid, session_id, project_uuid, role, role_type, content,
                      token_count, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                )
                .storage_context("prepare create messages")?;
            for message in messages {
                if message.token_count < 0 {
                    return Err(MemoryError::BadRequest("token_count cannot be negative".to_string()));
                }
                let uuid = message.uuid.unwrap_or_else(Uuid::new_v4);
                let metadata = message.metadata.clone().unwrap_or_default();
                stmt.execute(params![
                    uuid.to_string(),
                    session_uuid.to_string(),
                    session_id,
                    scope.project(),
                    &message.role,
                    message.role_type.as_str(),
                    &message.content,
                    message.token_count,
                    metadata.to_json()?,
                    now,
                ])
                .storage_context("create messages")?;
                uuids.push(uuid);
            }
        }
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE uuid = ?2",
            params![now, session_uuid.to_string()],
        )
        .storage_context("touch session")?;
        tx.commit().storage_context("commit create messages")?;
        drop(conn);

        debug!("Stored {} messages in batch for session {}", uuids.len(), session_id);
        self.get_list_by_uuid(scope, &uuids)
    }

    pub fn get(&self, scope: &TenantScope, uuid: &Uuid) -> Result<Message> {
        let conn = self.get_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM messages WHERE project_uuid = ?1 AND uuid = ?2 AND deleted_at IS NULL",
                MESSAGE_COLUMNS
            ),
            params![scope.project(), uuid.to_string()],
            |row| Ok(row_to_message(row)),
        )
        .optional()
        .storage_context("get message")?
        .ok_or_else(|| MemoryError::NotFound(format!("message {} not found", uuid)))?
    }

    /// Most recent `last_n` messages (0 = all), returned oldest first.
    ///
    /// A `before` UUID that cannot be resolved is treated as no upper bound.
    pub fn get_last_n(
        &self,
        scope: &TenantScope,
        session_id: &str,
        last_n: i64,
        before: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        if last_n < 0 {
            return Err(MemoryError::BadRequest("lastN cannot be negative".to_string()));
        }
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?;

        let anchor = match before {
            Some(uuid) => {
                let id = message_id(&conn, scope, &session_uuid, &uuid, false)?;
                if id.is_none() {
                    debug!("Anchor message {} not found, reading without upper bound", uuid);
                }
                id
            }
            None => None,
        };

        let limit = if last_n == 0 { -1 } else { last_n };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages
                 WHERE session_uuid = ?1 AND project_uuid = ?2 AND deleted_at IS NULL
                   AND (?3 IS NULL OR id < ?3)
                 ORDER BY id DESC LIMIT ?4",
                MESSAGE_COLUMNS
            ))
            .storage_context("prepare last n messages")?;
        let rows = stmt
            .query(params![session_uuid.to_string(), scope.project(), anchor, limit])
            .storage_context("last n messages")?;
        let mut messages = collect_messages(rows)?;
        messages.reverse();
        Ok(messages)
    }

    /// Messages with the given UUIDs, in id order; unknown UUIDs are skipped
    pub fn get_list_by_uuid(&self, scope: &TenantScope, uuids: &[Uuid]) -> Result<Vec<Message>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = (0..uuids.len()).map(|i| format!("?{}", i + 2)).collect::<Vec<_>>().join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages
                 WHERE project_uuid = ?1 AND deleted_at IS NULL AND uuid IN ({})
                 ORDER BY id ASC",
                MESSAGE_COLUMNS, placeholders
            ))
            .storage_context("prepare messages by uuid")?;

        let mut values = vec![SqlValue::Text(scope.project())];
        values.extend(uuids.iter().map(|u| SqlValue::Text(u.to_string())));
        let rows = stmt.query(params_from_iter(values)).storage_context("messages by uuid")?;
        collect_messages(rows)
    }

    /// One page (1-based) of a session's messages; the total count is read
    /// concurrently with the page.
    pub async fn get_list_by_session(
        &self,
        scope: &TenantScope,
        session_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<MessageListResponse> {
        if page < 1 || page_size < 1 {
            return Err(MemoryError::BadRequest(format!(
                "invalid pagination: page {} size {}",
                page, page_size
            )));
        }
        let session_uuid = {
            let conn = self.get_conn()?;
            resolve_session_uuid(&conn, scope, session_id)?.to_string()
        };
        let project = scope.project();

        let count_task = {
            let pool = Arc::clone(&self.pool);
            let session_uuid = session_uuid.clone();
            let project = project.clone();
            tokio::task::spawn_blocking(move || -> Result<i64> {
                let conn = pool.get().storage_context("count messages connection")?;
                conn.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE session_uuid = ?1 AND project_uuid = ?2 AND deleted_at IS NULL",
                    params![session_uuid, project],
                    |row| row.get(0),
                )
                .storage_context("count messages")
            })
        };
        let page_task = {
            let pool = Arc::clone(&self.pool);
            tokio::task::spawn_blocking(move || -> Result<Vec<Message>> {
                let conn = pool.get().storage_context("page messages connection")?;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM messages
                         WHERE session_uuid = ?1 AND project_uuid = ?2 AND deleted_at IS NULL
                         ORDER BY id ASC LIMIT ?3 OFFSET ?4",
                        MESSAGE_COLUMNS
                    ))
                    .storage_context("prepare page messages")?;
                let rows = stmt
                    .query(params![session_uuid, project, page_size, (page - 1) * page_size])
                    .storage_context("page messages")?;
                collect_messages(rows)
            })
        };

        let (count, messages) = tokio::join!(count_task, page_task);
        let total_count = count??;
        let messages = messages??;
        Ok(MessageListResponse {
            row_count: messages.len(),
            messages,
            total_count,
        })
    }

    /// Messages with `id > after_id`, ascending
    pub fn get_since(&self, scope: &TenantScope, session_id: &str, after_id: i64) -> Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM messages
                 WHERE session_uuid = ?1 AND project_uuid = ?2 AND deleted_at IS NULL AND id > ?3
                 ORDER BY id ASC",
                MESSAGE_COLUMNS
            ))
            .storage_context("prepare messages since")?;
        let rows = stmt
            .query(params![session_uuid.to_string(), scope.project(), after_id])
            .storage_context("messages since")?;
        collect_messages(rows)
    }

    /// Store id of a message in the session, soft-deleted rows included.
    /// Deleting a message keeps its position usable as a boundary.
    pub fn resolve_id(&self, scope: &TenantScope, session_id: &str, uuid: &Uuid) -> Result<Option<i64>> {
        let conn = self.get_conn()?;
        let session_uuid = resolve_session_uuid(&conn, scope, session_id)?;
        message_id(&conn, scope, &session_uuid, uuid, true)
    }

    pub async fn update(&self, scope: &TenantScope, update: MessageUpdate, privileged: bool) -> Result<Message> {
        let uuid = update.uuid;
        self.update_many(scope, vec![update], privileged)
            .await?
            .pop()
            .ok_or_else(|| MemoryError::NotFound(format!("message {} not found", uuid)))
    }

    /// Two phases: one bulk statement for the plain columns, then a
    /// lock-guarded merge per message carrying metadata. A failed merge leaves
    /// the column update in place.
    pub async fn update_many(
        &self,
        scope: &TenantScope,
        updates: Vec<MessageUpdate>,
        privileged: bool,
    ) -> Result<Vec<Message>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        for update in &updates {
            if !seen.insert(update.uuid) {
                return Err(MemoryError::BadRequest(format!("message {} listed twice", update.uuid)));
            }
            if update.token_count.map_or(false, |t| t < 0) {
                return Err(MemoryError::BadRequest("token_count cannot be negative".to_string()));
            }
        }

        let updates = Arc::new(updates);
        {
            let store = self.clone();
            let (scope, updates) = (scope.clone(), Arc::clone(&updates));
            tokio::task::spawn_blocking(move || store.update_columns(&scope, &updates)).await??;
        }

        for update in updates.iter() {
            if let Some(metadata) = update.metadata.clone() {
                let patch = MetadataPatch::from(metadata);
                if patch.is_empty() {
                    continue;
                }
                self.merger
                    .merge_metadata(scope, EntityKind::Message, update.uuid, patch, privileged)
                    .await?;
            }
        }

        let uuids: Vec<Uuid> = updates.iter().map(|u| u.uuid).collect();
        let store = self.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || store.get_list_by_uuid(&scope, &uuids)).await?
    }

    fn update_columns(&self, scope: &TenantScope, updates: &[MessageUpdate]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction().storage_context("begin update messages")?;

        let mut values: Vec<SqlValue> = vec![SqlValue::Text(scope.project()), SqlValue::Text(format_timestamp(&Utc::now()))];
        let mut rows = Vec::with_capacity(updates.len());
        for update in updates {
            let base = values.len();
            rows.push(format!("(?{}, ?{}, ?{}, ?{}, ?{})", base + 1, base + 2, base + 3, base + 4, base + 5));
            values.push(SqlValue::Text(update.uuid.to_string()));
            values.push(update.role.clone().map_or(SqlValue::Null, SqlValue::Text));
            values.push(update.role_type.map_or(SqlValue::Null, |r| SqlValue::Text(r.as_str().to_string())));
            values.push(update.content.clone().map_or(SqlValue::Null, SqlValue::Text));
            values.push(update.token_count.map_or(SqlValue::Null, |t| SqlValue::Integer(t as i64)));
        }

        let sql = format!(
            "WITH v(uuid, role, role_type, content, token_count) AS (VALUES {})
             UPDATE messages SET
                role = COALESCE(v.role, messages.role),
                role_type = COALESCE(v.role_type, messages.role_type),
                content = COALESCE(v.content, messages.content),
                token_count = COALESCE(v.token_count, messages.token_count),
                updated_at = ?2
             FROM v
             WHERE messages.uuid = v.uuid AND messages.project_uuid = ?1 AND messages.deleted_at IS NULL",
            rows.join(", ")
        );
        let updated = tx.execute(&sql, params_from_iter(values)).storage_context("update messages")?;
        if updated != updates.len() {
            // dropping the transaction rolls the statement back
            return Err(MemoryError::NotFound(format!(
                "{} of {} messages not found",
                updates.len() - updated,
                updates.len()
            )));
        }
        tx.commit().storage_context("commit update messages")?;
        Ok(())
    }

    pub fn delete(&self, scope: &TenantScope, uuid: &Uuid) -> Result<()> {
        let conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());
        let deleted = conn
            .execute(
                "UPDATE messages SET deleted_at = ?1
                 WHERE uuid = ?2 AND project_uuid = ?3 AND deleted_at IS NULL",
                params![now, uuid.to_string(), scope.project()],
            )
            .storage_context("delete message")?;
        if deleted == 0 {
            return Err(MemoryError::NotFound(format!("message {} not found", uuid)));
        }
        info!("Deleted message {}", uuid);
        Ok(())
    }
}

/// Resolve a session that may be written to; ended sessions are rejected
fn writable_session(conn: &Connection, scope: &TenantScope, session_id: &str) -> Result<Uuid> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT uuid, ended_at FROM sessions
             WHERE project_uuid = ?1 AND session_id = ?2 AND deleted_at IS NULL",
            params![scope.project(), session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .storage_context("resolve writable session")?;
    match row {
        Some((_, Some(_))) => Err(MemoryError::SessionEnded(session_id.to_string())),
        Some((uuid, None)) => parse_uuid(&uuid),
        None => Err(MemoryError::NotFound(format!("session {} not found", session_id))),
    }
}

fn message_id(
    conn: &Connection,
    scope: &TenantScope,
    session_uuid: &Uuid,
    uuid: &Uuid,
    include_deleted: bool,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM messages
         WHERE uuid = ?1 AND project_uuid = ?2 AND session_uuid = ?3
           AND (?4 OR deleted_at IS NULL)",
        params![uuid.to_string(), scope.project(), session_uuid.to_string(), include_deleted],
        |row| row.get(0),
    )
    .optional()
    .storage_context("resolve message id")
}


fn collect_messages(mut rows: rusqlite::Rows<'_>) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    while let Some(row) = rows.next().storage_context("read messages")? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

fn row_to_message(row: &Row) -> Result<Message> {
    let uuid: String = row.get(0)?;
    let project: String = row.get(3)?;
    let role_type: String = row.get(5)?;
    let metadata: String = row.get(8)?;
    Ok(Message {
        uuid: parse_uuid(&uuid)?,
        id: row.get(1)?,
        session_id: row.get(2)?,
        project_uuid: parse_uuid(&project)?,
        role: row.get(4)?,
        role_type: role_type.parse()?,
        content: row.get(6)?,
        token_count: row.get(7)?,
        metadata: MetadataDocument::from_json(&metadata)?,
        metadata_version: row.get(9)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(11)?)?,
        deleted_at: parse_optional_timestamp(row.get(12)?)?,
    })
}
