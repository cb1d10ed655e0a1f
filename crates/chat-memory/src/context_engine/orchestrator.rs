//! Memory orchestrator: composes the stores into GetMemory / PutMemory /
//! SearchMemory and hands new messages to the extractor dispatcher.
use crate::call_context::CallContext;
use crate::context_engine::fusion::reciprocal_rank_fusion;
use crate::context_engine::multi_question::MultiQuestionRetriever;
use crate::error::{MemoryError, Result};
use crate::memory::{Fact, Memory, MessagePayload, SessionSearchResult, SummaryPayload};
use crate::memory_db::{
    CreateSessionRequest, MemoryDatabase, Message, NewMessage, SearchHit, SearchOptions, SearchScope, Session,
    Summary, TenantScope,
};
use crate::worker_threads::{ExtractorDispatcher, ExtractorEvent, LlmService};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages and summary selected by the GetMemory windowing rule
#[derive(Debug, Clone)]
pub struct MemoryWindow {
    pub session: Session,
    pub summary: Option<Summary>,
    pub messages: Vec<Message>,
}

impl From<MemoryWindow> for Memory {
    fn from(window: MemoryWindow) -> Self {
        let metadata = window.session.metadata;
        Memory {
            messages: window.messages.into_iter().map(MessagePayload::from).collect(),
            metadata: (!metadata.is_empty()).then_some(metadata),
            relevant_facts: Vec::new(),
            summary: window.summary.map(SummaryPayload::from),
        }
    }
}

#[derive(Debug, Clone)]
enum RankedHit {
    Message(SearchHit),
    Summary(SearchHit),
}

impl RankedHit {
    fn uuid(&self) -> Uuid {
        match self {
            RankedHit::Message(hit) | RankedHit::Summary(hit) => hit.uuid,
        }
    }
}

pub struct MemoryOrchestrator {
    database: Arc<MemoryDatabase>,
    llm: Arc<dyn LlmService>,
    dispatcher: Arc<ExtractorDispatcher>,
    retriever: Option<Arc<MultiQuestionRetriever>>,
}

impl MemoryOrchestrator {
    pub fn new(database: Arc<MemoryDatabase>, llm: Arc<dyn LlmService>, dispatcher: Arc<ExtractorDispatcher>) -> Self {
        info!(
            "Memory orchestrator initialized with {} extractor(s)",
            dispatcher.extractor_count()
        );
        Self {
            database,
            llm,
            dispatcher,
            retriever: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<MultiQuestionRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    /// Windowed memory of a session.
    ///
    /// - `last_n > 0`: the `last_n` most recent messages plus the latest summary.
    /// - otherwise, with a summary: every message after the summary point.
    /// - otherwise: every live message, no summary.
    pub async fn get_memory(&self, scope: &TenantScope, session_id: &str, last_n: i64) -> Result<Memory> {
        Ok(self.get_memory_window(scope, session_id, last_n).await?.into())
    }

    pub async fn get_memory_window(&self, scope: &TenantScope, session_id: &str, last_n: i64) -> Result<MemoryWindow> {
        if last_n < 0 {
            return Err(MemoryError::BadRequest("lastN cannot be negative".to_string()));
        }
        let database = Arc::clone(&self.database);
        let scope = scope.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || window(&database, &scope, &session_id, last_n)).await?
    }

    /// Store `messages`, creating the session on first write, then enqueue an
    /// extractor event unless `skip_notify`. Never waits on extractors.
    pub async fn put_memory(
        &self,
        scope: &TenantScope,
        session_id: &str,
        messages: Vec<NewMessage>,
        skip_notify: bool,
    ) -> Result<Vec<Message>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let database = Arc::clone(&self.database);
        let write_scope = scope.clone();
        let write_session = session_id.to_string();
        let created = tokio::task::spawn_blocking(move || {
            ensure_session(&database, &write_scope, &write_session)?;
            database.messages.create_many(&write_scope, &write_session, &messages)
        })
        .await??;
        debug!("Stored {} message(s) in session {}", created.len(), session_id);

        if !skip_notify {
            let event = ExtractorEvent::new(scope.clone(), session_id, created.clone());
            let accepted = self.dispatcher.dispatch(event);
            debug!("Extractor event accepted by {} queue(s)", accepted);
        }
        Ok(created)
    }

    /// Embed `text`, search message and summary embeddings, and fuse the two
    /// rankings with RRF. Results reach across the user's sessions when the
    /// session has a user.
    pub async fn search_memory(
        &self,
        ctx: &CallContext,
        scope: &TenantScope,
        session_id: &str,
        text: &str,
        limit: usize,
        mmr_lambda: Option<f32>,
    ) -> Result<Vec<SessionSearchResult>> {
        if text.trim().is_empty() {
            return Err(MemoryError::BadRequest("search text cannot be empty".to_string()));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let session = self.database.sessions.get(scope, session_id)?;
        let filter = match session.user_id {
            Some(user_id) => SearchScope::User(user_id),
            None => SearchScope::Session(session.session_id),
        };

        let query = self
            .llm
            .embed_texts(ctx, &[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| MemoryError::Llm("no embedding returned for search text".to_string()))?;
        ctx.check()?;

        let database = Arc::clone(&self.database);
        let scope = scope.clone();
        let options = SearchOptions {
            limit,
            min_score: 0.0,
            mmr_lambda,
        };
        tokio::task::spawn_blocking(move || {
            let messages = database.embeddings.search_messages(&scope, &filter, &query, &options)?;
            let summaries = database.embeddings.search_summaries(&scope, &filter, &query, &options)?;
            let fused = reciprocal_rank_fusion(
                vec![
                    messages.into_iter().map(RankedHit::Message).collect(),
                    summaries.into_iter().map(RankedHit::Summary).collect(),
                ],
                RankedHit::uuid,
            );
            let top: Vec<(RankedHit, f64)> = fused.into_iter().take(limit).map(|f| (f.item, f.score)).collect();
            to_results(&database, &scope, top)
        })
        .await?
    }

    /// Summaries relevant to the last `history_len` messages, via the
    /// multi-question retriever
    pub async fn relevant_summaries(
        &self,
        ctx: &CallContext,
        scope: &TenantScope,
        session_id: &str,
        history_len: i64,
    ) -> Result<Vec<Summary>> {
        let retriever = self
            .retriever
            .as_ref()
            .ok_or_else(|| MemoryError::Config("multi-question retrieval is not configured".to_string()))?;
        let history = self.get_memory_window(scope, session_id, history_len).await?.messages;
        if history.is_empty() {
            return Ok(Vec::new());
        }
        let count = retriever.settings().question_count;
        retriever.retrieve(ctx, scope, session_id, &history, count).await
    }
}

fn window(database: &MemoryDatabase, scope: &TenantScope, session_id: &str, last_n: i64) -> Result<MemoryWindow> {
    let session = database.sessions.get(scope, session_id)?;
    let summary = database.summaries.get_latest(scope, session_id)?;

    let messages = if last_n > 0 {
        database.messages.get_last_n(scope, session_id, last_n, None)?
    } else if let Some(summary) = &summary {
        match database.messages.resolve_id(scope, session_id, &summary.summary_point_uuid)? {
            Some(point) => database.messages.get_since(scope, session_id, point)?,
            None => {
                warn!(
                    "Summary point {} of session {} was purged, returning full history",
                    summary.summary_point_uuid, session_id
                );
                database.messages.get_last_n(scope, session_id, 0, None)?
            }
        }
    } else {
        database.messages.get_last_n(scope, session_id, 0, None)?
    };

    Ok(MemoryWindow {
        session,
        summary,
        messages,
    })
}

fn ensure_session(database: &MemoryDatabase, scope: &TenantScope, session_id: &str) -> Result<()> {
    match database.sessions.get(scope, session_id) {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            let request = CreateSessionRequest {
                session_id: session_id.to_string(),
                ..Default::default()
            };
            match database.sessions.create(scope, &request) {
                Ok(_) => Ok(()),
                // a concurrent writer created it first
                Err(MemoryError::BadRequest(_)) => database.sessions.get(scope, session_id).map(|_| ()),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

fn to_results(database: &MemoryDatabase, scope: &TenantScope, top: Vec<(RankedHit, f64)>) -> Result<Vec<SessionSearchResult>> {
    let mut message_uuids = Vec::new();
    let mut summary_uuids = Vec::new();
    for (hit, _) in &top {
        match hit {
            RankedHit::Message(h) => message_uuids.push(h.uuid),
            RankedHit::Summary(h) => summary_uuids.push(h.uuid),
        }
    }

    let mut content: HashMap<Uuid, (String, DateTime<Utc>)> = HashMap::new();
    for message in database.messages.get_list_by_uuid(scope, &message_uuids)? {
        content.insert(message.uuid, (message.content, message.created_at));
    }
    for summary in database.summaries.get_list_by_uuid(scope, &summary_uuids)? {
        content.insert(summary.uuid, (summary.content, summary.created_at));
    }

    Ok(top
        .into_iter()
        .filter_map(|(hit, score)| {
            let uuid = hit.uuid();
            content.remove(&uuid).map(|(fact, created_at)| SessionSearchResult {
                fact: Fact {
                    uuid,
                    created_at,
                    fact,
                    rating: Some(score),
                },
            })
        })
        .collect())
}
