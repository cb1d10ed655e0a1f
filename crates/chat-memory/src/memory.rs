//! JSON payloads exchanged with applications
use crate::memory_db::{Message, MetadataDocument, NewMessage, RoleType, Summary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as applications send and receive it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub role_type: RoleType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDocument>,
    #[serde(default)]
    pub token_count: i32,
}

impl From<Message> for MessagePayload {
    fn from(message: Message) -> Self {
        Self {
            uuid: Some(message.uuid),
            created_at: Some(message.created_at),
            updated_at: Some(message.updated_at),
            role: message.role,
            role_type: message.role_type,
            content: message.content,
            metadata: (!message.metadata.is_empty()).then_some(message.metadata),
            token_count: message.token_count,
        }
    }
}

impl From<MessagePayload> for NewMessage {
    fn from(payload: MessagePayload) -> Self {
        NewMessage {
            uuid: payload.uuid,
            role: payload.role,
            role_type: payload.role_type,
            content: payload.content,
            token_count: payload.token_count,
            metadata: payload.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub token_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDocument>,
}

impl From<Summary> for SummaryPayload {
    fn from(summary: Summary) -> Self {
        Self {
            uuid: summary.uuid,
            created_at: summary.created_at,
            content: summary.content,
            token_count: summary.token_count,
            metadata: (!summary.metadata.is_empty()).then_some(summary.metadata),
        }
    }
}

/// A retrieved piece of knowledge with its relevance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub fact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// `GetMemory` response body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub messages: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDocument>,
    #[serde(default)]
    pub relevant_facts: Vec<Fact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryPayload>,
}

/// One `SearchMemory` hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSearchResult {
    pub fact: Fact,
}
