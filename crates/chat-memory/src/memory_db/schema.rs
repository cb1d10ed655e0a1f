//! Row types for the memory system
use crate::error::{MemoryError, Result};
use crate::memory_db::metadata::MetadataDocument;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant boundary applied to every query: schema (database) name + project
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub schema: String,
    pub project_uuid: Uuid,
}

impl TenantScope {
    pub fn new(schema: impl Into<String>, project_uuid: Uuid) -> Self {
        Self { schema: schema.into(), project_uuid }
    }

    pub(crate) fn project(&self) -> String {
        self.project_uuid.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    #[default]
    NoRole,
    System,
    Assistant,
    User,
    Function,
    Tool,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::NoRole => "norole",
            RoleType::System => "system",
            RoleType::Assistant => "assistant",
            RoleType::User => "user",
            RoleType::Function => "function",
            RoleType::Tool => "tool",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "norole" => Ok(RoleType::NoRole),
            "system" => Ok(RoleType::System),
            "assistant" => Ok(RoleType::Assistant),
            "user" => Ok(RoleType::User),
            "function" => Ok(RoleType::Function),
            "tool" => Ok(RoleType::Tool),
            other => Err(MemoryError::BadRequest(format!("unknown role type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub uuid: Uuid,
    pub id: i64,
    pub session_id: String,
    pub user_id: Option<String>,
    pub project_uuid: Uuid,
    pub metadata: MetadataDocument,
    pub metadata_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<MetadataDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<MetadataDocument>,
}

/// Stored conversation message. `id` is the per-store total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub id: i64,
    pub session_id: String,
    pub project_uuid: Uuid,
    pub role: String,
    pub role_type: RoleType,
    pub content: String,
    pub token_count: i32,
    pub metadata: MetadataDocument,
    pub metadata_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Message as supplied by a writer, before the store assigns `id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub role: String,
    #[serde(default)]
    pub role_type: RoleType,
    pub content: String,
    #[serde(default)]
    pub token_count: i32,
    #[serde(default)]
    pub metadata: Option<MetadataDocument>,
}

impl NewMessage {
    pub fn new(role_type: RoleType, content: impl Into<String>) -> Self {
        Self {
            uuid: None,
            role: role_type.as_str().to_string(),
            role_type,
            content: content.into(),
            token_count: 0,
            metadata: None,
        }
    }
}

/// Partial update of a message. `content` is only written when set.
#[derive(Debug, Clone, Default)]
pub struct MessageUpdate {
    pub uuid: Uuid,
    pub role: Option<String>,
    pub role_type: Option<RoleType>,
    pub content: Option<String>,
    pub token_count: Option<i32>,
    pub metadata: Option<MetadataDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub uuid: Uuid,
    pub session_uuid: Uuid,
    pub content: String,
    pub summary_point_uuid: Uuid,
    pub token_count: i32,
    pub metadata: MetadataDocument,
    pub metadata_version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSummary {
    pub content: String,
    pub summary_point_uuid: Uuid,
    pub token_count: i32,
    pub metadata: Option<MetadataDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEmbedding {
    pub message_uuid: Uuid,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEmbedding {
    pub summary_uuid: Uuid,
    pub vector: Vec<f32>,
}

/// Columns sessions may be listed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrderBy {
    #[default]
    Id,
    CreatedAt,
    UpdatedAt,
    SessionId,
}

impl SessionOrderBy {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SessionOrderBy::Id => "id",
            SessionOrderBy::CreatedAt => "created_at",
            SessionOrderBy::UpdatedAt => "updated_at",
            SessionOrderBy::SessionId => "session_id",
        }
    }
}

impl FromStr for SessionOrderBy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "id" => Ok(SessionOrderBy::Id),
            "created_at" => Ok(SessionOrderBy::CreatedAt),
            "updated_at" => Ok(SessionOrderBy::UpdatedAt),
            "session_id" => Ok(SessionOrderBy::SessionId),
            other => Err(MemoryError::BadRequest(format!("cannot order sessions by '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    pub total_count: i64,
    pub response_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
    pub total_count: i64,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryListResponse {
    pub summaries: Vec<Summary>,
    pub total_count: i64,
    pub row_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub sessions: usize,
    pub messages: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_summaries: i64,
    pub total_message_embeddings: i64,
    pub total_summary_embeddings: i64,
    pub database_size_bytes: i64,
}

/// Fixed-precision UTC text so lexical and chronological order agree
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    Err(MemoryError::storage(
        "parse timestamp",
        format!("unrecognised timestamp '{}'", raw),
    ))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| MemoryError::storage("parse uuid", e))
}
