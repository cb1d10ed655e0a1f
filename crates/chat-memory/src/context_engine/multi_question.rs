//! Multi-question retrieval over stored summaries.
//!
//! The LLM rephrases the recent conversation as several standalone questions.
//! Each question is embedded and searched against summary embeddings in
//! parallel; the union of hits is either returned as-is (zero or one summary)
//! or reduced by a second LLM call into one consolidated summary.
use crate::call_context::CallContext;
use crate::error::{MemoryError, Result};
use crate::memory_db::{MemoryDatabase, MetadataDocument, Message, SearchOptions, SearchScope, Summary, TenantScope};
use crate::worker_threads::LlmService;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

lazy_static! {
    static ref QUESTIONS_BLOCK: Regex = Regex::new(r"(?s)<questions>(.*?)</questions>").unwrap();
    static ref LIST_MARKER: Regex = Regex::new(r"^(?:[-*•]|\d+[.)])\s+").unwrap();
}

#[derive(Debug, Clone)]
pub struct MultiQuestionSettings {
    pub question_count: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub results_per_question: usize,
    pub min_score: f32,
    pub mmr_lambda: f32,
}

impl Default for MultiQuestionSettings {
    fn default() -> Self {
        Self {
            question_count: 3,
            concurrency: 4,
            timeout: Duration::from_secs(30),
            results_per_question: 3,
            min_score: 0.7,
            mmr_lambda: 0.5,
        }
    }
}

pub struct MultiQuestionRetriever {
    database: Arc<MemoryDatabase>,
    llm: Arc<dyn LlmService>,
    settings: MultiQuestionSettings,
}

impl MultiQuestionRetriever {
    pub fn new(database: Arc<MemoryDatabase>, llm: Arc<dyn LlmService>, settings: MultiQuestionSettings) -> Self {
        Self { database, llm, settings }
    }

    pub fn settings(&self) -> &MultiQuestionSettings {
        &self.settings
    }

    /// Summaries relevant to `history`. The whole call, including question
    /// generation, the search fan-out and the reduce step, shares one deadline.
    pub async fn retrieve(
        &self,
        ctx: &CallContext,
        scope: &TenantScope,
        session_id: &str,
        history: &[Message],
        question_count: usize,
    ) -> Result<Vec<Summary>> {
        let ctx = ctx.child_with_timeout(self.settings.timeout);
        ctx.run(self.retrieve_within(&ctx, scope, session_id, history, question_count))
            .await
    }

    async fn retrieve_within(
        &self,
        ctx: &CallContext,
        scope: &TenantScope,
        session_id: &str,
        history: &[Message],
        question_count: usize,
    ) -> Result<Vec<Summary>> {
        let session = {
            let database = Arc::clone(&self.database);
            let (scope, session_id) = (scope.clone(), session_id.to_string());
            tokio::task::spawn_blocking(move || database.sessions.get(&scope, &session_id)).await??
        };
        let filter = match &session.user_id {
            Some(user_id) => SearchScope::User(user_id.clone()),
            None => SearchScope::Session(session.session_id.clone()),
        };

        let prompt = question_prompt(&format_history(history), question_count.max(1));
        let response = self.llm.call(ctx, &prompt).await?;
        let questions = parse_questions(&response, question_count.max(1))?;
        debug!("Generated {} retrieval question(s) for session {}", questions.len(), session_id);

        let uuids = self.search_all(ctx, scope, &filter, &questions).await?;
        let mut summaries = {
            let database = Arc::clone(&self.database);
            let scope = scope.clone();
            tokio::task::spawn_blocking(move || database.summaries.get_list_by_uuid(&scope, &uuids)).await??
        };

        match summaries.len() {
            0 => Ok(Vec::new()),
            1 => Ok(summaries),
            n => {
                info!("Reducing {} summaries for session {}", n, session_id);
                summaries.sort_by_key(|s| s.created_at);
                let reduced = self.llm.call(ctx, &reduce_prompt(&questions, &summaries)).await?;
                Ok(vec![synthesized_summary(session.uuid, reduced, &summaries)])
            }
        }
    }

    /// One bounded, fail-fast search task per question. Hits are merged in
    /// question order, unique by UUID.
    async fn search_all(
        &self,
        ctx: &CallContext,
        scope: &TenantScope,
        filter: &SearchScope,
        questions: &[String],
    ) -> Result<Vec<Uuid>> {
        let fanout = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let options = SearchOptions {
            limit: self.settings.results_per_question,
            min_score: self.settings.min_score,
            mmr_lambda: Some(self.settings.mmr_lambda),
        };

        let mut tasks = JoinSet::new();
        for (index, question) in questions.iter().enumerate() {
            let task_ctx = fanout.child();
            let semaphore = Arc::clone(&semaphore);
            let database = Arc::clone(&self.database);
            let llm = Arc::clone(&self.llm);
            let scope = scope.clone();
            let filter = filter.clone();
            let options = options.clone();
            let question = question.clone();
            tasks.spawn(async move {
                let _permit = task_ctx
                    .run(async { semaphore.acquire_owned().await.map_err(|_| MemoryError::Cancelled) })
                    .await?;
                let hits = search_question(&task_ctx, database, llm.as_ref(), scope, filter, question, options).await?;
                Ok::<_, MemoryError>((index, hits))
            });
        }

        let mut per_question: Vec<Vec<Uuid>> = vec![Vec::new(); questions.len()];
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(MemoryError::from(e)),
            };
            match outcome {
                Ok((index, hits)) => per_question[index] = hits,
                Err(e) => {
                    warn!("Question search failed, cancelling siblings: {}", e);
                    fanout.cancel();
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let mut seen = HashSet::new();
        Ok(per_question
            .into_iter()
            .flatten()
            .filter(|uuid| seen.insert(*uuid))
            .collect())
    }
}

async fn search_question(
    ctx: &CallContext,
    database: Arc<MemoryDatabase>,
    llm: &dyn LlmService,
    scope: TenantScope,
    filter: SearchScope,
    question: String,
    options: SearchOptions,
) -> Result<Vec<Uuid>> {
    let mut vectors = llm.embed_texts(ctx, std::slice::from_ref(&question)).await?;
    let query = vectors
        .pop()
        .ok_or_else(|| MemoryError::Llm(format!("no embedding returned for question '{}'", question)))?;
    ctx.check()?;
    let hits = tokio::task::spawn_blocking(move || {
        database.embeddings.search_summaries(&scope, &filter, &query, &options)
    })
    .await??;
    Ok(hits.into_iter().map(|hit| hit.uuid).collect())
}

fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| {
            let speaker = if m.role.is_empty() { m.role_type.as_str() } else { m.role.as_str() };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn question_prompt(history: &str, count: usize) -> String {
    format!(
        "Read the chat history below and write {count} different standalone questions that \
         would retrieve the background knowledge needed to continue the conversation. \
         Put one question per line between <questions> and </questions> tags and write \
         nothing else.\n\n<chat_history>\n{history}\n</chat_history>",
    )
}

fn reduce_prompt(questions: &[String], summaries: &[Summary]) -> String {
    let questions = questions.join("\n");
    let summaries = summaries
        .iter()
        .map(|s| format!("<summary>\n{}\n</summary>", s.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Combine the summaries below into one concise summary. Keep only information that \
         helps answer these questions and drop everything else.\n\n<questions>\n{questions}\n</questions>\n\n{summaries}",
    )
}

/// Questions between `<questions>` tags, one per non-empty line
pub fn parse_questions(response: &str, limit: usize) -> Result<Vec<String>> {
    let block = QUESTIONS_BLOCK
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("");
    let questions: Vec<String> = block
        .lines()
        .map(|line| LIST_MARKER.replace(line.trim(), "").trim().to_string())
        .filter(|line| !line.is_empty())
        .take(limit)
        .collect();
    if questions.is_empty() {
        return Err(MemoryError::Llm("no questions generated".to_string()));
    }
    Ok(questions)
}

fn synthesized_summary(session_uuid: Uuid, content: String, sources: &[Summary]) -> Summary {
    let source_uuids: Vec<String> = sources.iter().map(|s| s.uuid.to_string()).collect();
    // newest source decides how far the reduced summary reaches
    let summary_point_uuid = sources
        .last()
        .map(|s| s.summary_point_uuid)
        .unwrap_or_else(Uuid::nil);
    Summary {
        uuid: Uuid::new_v4(),
        session_uuid,
        token_count: 0,
        content,
        summary_point_uuid,
        metadata: MetadataDocument::new().with("source_summaries", json!(source_uuids)),
        metadata_version: 0,
        created_at: Utc::now(),
    }
}
