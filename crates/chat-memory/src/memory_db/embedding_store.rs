//! Embedding storage and similarity search
use crate::context_engine::similarity::{cosine_similarity, maximal_marginal_relevance};
use crate::error::{MemoryError, Result, StorageContext};
use crate::memory_db::schema::*;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Which sessions a search may read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    Session(String),
    /// Every live session of the user
    User(String),
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: f32,
    /// MMR re-rank with this lambda when set
    pub mmr_lambda: Option<f32>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            mmr_lambda: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub uuid: Uuid,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub message_embeddings: i64,
    pub summary_embeddings: i64,
    pub dimensions: usize,
}

pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    dimensions: usize,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().storage_context("embedding store connection")
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_width(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::EmbeddingMismatch {
                expected: self.dimensions,
                found: vector.len(),
            });
        }
        Ok(())
    }

    /// Store (or replace) message vectors. The batch is written atomically:
    /// any bad width or unknown message leaves nothing behind.
    pub fn put_message_embeddings(&self, scope: &TenantScope, embeddings: &[MessageEmbedding]) -> Result<()> {
        for embedding in embeddings {
            self.check_width(&embedding.vector)?;
        }
        if embeddings.is_empty() {
            return Ok(());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction().storage_context("begin put message embeddings")?;
        let now = format_timestamp(&Utc::now());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO message_embeddings
                     (message_uuid, project_uuid, vector, dimensions, created_at)
                     SELECT uuid, project_uuid, ?3, ?4, ?5 FROM messages
                     WHERE uuid = ?1 AND project_uuid = ?2 AND deleted_at IS NULL",
                )
                .storage_context("prepare put message embeddings")?;
            for embedding in embeddings {
                let blob = bincode::serialize(&embedding.vector).storage_context("encode vector")?;
                let inserted = stmt
                    .execute(params![
                        embedding.message_uuid.to_string(),
                        scope.project(),
                        blob,
                        self.dimensions as i64,
                        now,
                    ])
                    .storage_context("put message embedding")?;
                if inserted == 0 {
                    return Err(MemoryError::NotFound(format!("message {} not found", embedding.message_uuid)));
                }
            }
        }
        tx.commit().storage_context("commit put message embeddings")?;

        debug!("Stored {} message embeddings", embeddings.len());
        Ok(())
    }

    /// Vectors of a session's live messages, in message order
    pub fn get_message_embeddings(&self, scope: &TenantScope, session_id: &str) -> Result<Vec<MessageEmbedding>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT e.message_uuid, e.vector FROM message_embeddings e
                 JOIN messages m ON m.uuid = e.message_uuid
                 JOIN sessions s ON s.uuid = m.session_uuid
                 WHERE s.session_id = ?1 AND s.project_uuid = ?2
                   AND s.deleted_at IS NULL AND m.deleted_at IS NULL
                 ORDER BY m.id ASC",
            )
            .storage_context("prepare get message embeddings")?;
        let mut rows = stmt
            .query(params![session_id, scope.project()])
            .storage_context("get message embeddings")?;
        let mut embeddings = Vec::new();
        while let Some(row) = rows.next().storage_context("get message embeddings")? {
            let uuid: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            embeddings.push(MessageEmbedding {
                message_uuid: parse_uuid(&uuid)?,
                vector: bincode::deserialize(&blob).storage_context("decode vector")?,
            });
        }
        Ok(embeddings)
    }

    pub fn put_summary_embedding(&self, scope: &TenantScope, embedding: &SummaryEmbedding) -> Result<()> {
        self.check_width(&embedding.vector)?;
        let blob = bincode::serialize(&embedding.vector).storage_context("encode vector")?;
        let conn = self.get_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR REPLACE INTO summary_embeddings
                 (summary_uuid, project_uuid, vector, dimensions, created_at)
                 SELECT uuid, project_uuid, ?3, ?4, ?5 FROM summaries
                 WHERE uuid = ?1 AND project_uuid = ?2",
                params![
                    embedding.summary_uuid.to_string(),
                    scope.project(),
                    blob,
                    self.dimensions as i64,
                    format_timestamp(&Utc::now()),
                ],
            )
            .storage_context("put summary embedding")?;
        if inserted == 0 {
            return Err(MemoryError::NotFound(format!("summary {} not found", embedding.summary_uuid)));
        }
        Ok(())
    }

    pub fn search_messages(
        &self,
        scope: &TenantScope,
        filter: &SearchScope,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (column, value) = scope_filter(filter);
        let sql = format!(
            "SELECT e.message_uuid, e.vector FROM message_embeddings e
             JOIN messages m ON m.uuid = e.message_uuid
             JOIN sessions s ON s.uuid = m.session_uuid
             WHERE e.project_uuid = ?1 AND s.{} = ?2
               AND s.deleted_at IS NULL AND m.deleted_at IS NULL",
            column
        );
        self.search(&sql, scope, value, query, options)
    }

    pub fn search_summaries(
        &self,
        scope: &TenantScope,
        filter: &SearchScope,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (column, value) = scope_filter(filter);
        let sql = format!(
            "SELECT e.summary_uuid, e.vector FROM summary_embeddings e
             JOIN summaries sm ON sm.uuid = e.summary_uuid
             JOIN sessions s ON s.uuid = sm.session_uuid
             WHERE e.project_uuid = ?1 AND s.{} = ?2 AND s.deleted_at IS NULL",
            column
        );
        self.search(&sql, scope, value, query, options)
    }

    /// Linear cosine scan, min-score cutoff, then either top-k or MMR
    fn search(
        &self,
        sql: &str,
        scope: &TenantScope,
        filter_value: &str,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.check_width(query)?;
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql).storage_context("prepare similarity search")?;
        let mut rows = stmt
            .query(params![scope.project(), filter_value])
            .storage_context("similarity search")?;

        let mut candidates: Vec<(Uuid, Vec<f32>, f32)> = Vec::new();
        while let Some(row) = rows.next().storage_context("similarity search")? {
            let uuid: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let vector: Vec<f32> = bincode::deserialize(&blob).storage_context("decode vector")?;
            if vector.len() != self.dimensions {
                // written under a different model configuration
                continue;
            }
            let score = cosine_similarity(query, &vector);
            if score >= options.min_score {
                candidates.push((parse_uuid(&uuid)?, vector, score));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let hits = match options.mmr_lambda {
            Some(lambda) => {
                let vectors: Vec<Vec<f32>> = candidates.iter().map(|c| c.1.clone()).collect();
                maximal_marginal_relevance(query, &vectors, lambda, options.limit)?
                    .into_iter()
                    .map(|i| SearchHit { uuid: candidates[i].0, score: candidates[i].2 })
                    .collect()
            }
            None => candidates
                .into_iter()
                .take(options.limit)
                .map(|(uuid, _, score)| SearchHit { uuid, score })
                .collect(),
        };
        Ok(hits)
    }

    pub fn get_stats(&self) -> Result<EmbeddingStats> {
        let conn = self.get_conn()?;
        let message_embeddings: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_embeddings", [], |row| row.get(0))
            .storage_context("count message embeddings")?;
        let summary_embeddings: i64 = conn
            .query_row("SELECT COUNT(*) FROM summary_embeddings", [], |row| row.get(0))
            .storage_context("count summary embeddings")?;
        info!(
            "Embedding stats: {} message, {} summary vectors ({} dims)",
            message_embeddings, summary_embeddings, self.dimensions
        );
        Ok(EmbeddingStats {
            message_embeddings,
            summary_embeddings,
            dimensions: self.dimensions,
        })
    }
}

fn scope_filter(filter: &SearchScope) -> (&'static str, &str) {
    match filter {
        SearchScope::Session(session_id) => ("session_id", session_id.as_str()),
        SearchScope::User(user_id) => ("user_id", user_id.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::test_support::test_db;
    use crate::memory_db::MemoryDatabase;

    fn seed(db: &MemoryDatabase, scope: &TenantScope, session_id: &str, user: Option<&str>) -> Vec<Message> {
        db.sessions
            .create(
                scope,
                &CreateSessionRequest {
                    session_id: session_id.into(),
                    user_id: user.map(str::to_string),
                    metadata: None,
                },
            )
            .unwrap();
        let batch: Vec<NewMessage> = (0..3).map(|i| NewMessage::new(RoleType::User, format!("m{}", i))).collect();
        db.messages.create_many(scope, session_id, &batch).unwrap()
    }

    #[test]
    fn test_width_mismatch_leaves_no_rows() {
        let (db, scope) = test_db();
        let messages = seed(&db, &scope, "s1", None);
        let batch = vec![
            MessageEmbedding { message_uuid: messages[0].uuid, vector: vec![1.0, 0.0, 0.0] },
            MessageEmbedding { message_uuid: messages[1].uuid, vector: vec![1.0, 0.0] },
        ];
        let err = db.embeddings.put_message_embeddings(&scope, &batch).unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingMismatch { expected: 3, found: 2 }));
        assert!(db.embeddings.get_message_embeddings(&scope, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_message_rolls_back_batch() {
        let (db, scope) = test_db();
        let messages = seed(&db, &scope, "s1", None);
        let batch = vec![
            MessageEmbedding { message_uuid: messages[0].uuid, vector: vec![1.0, 0.0, 0.0] },
            MessageEmbedding { message_uuid: Uuid::new_v4(), vector: vec![0.0, 1.0, 0.0] },
        ];
        assert!(db.embeddings.put_message_embeddings(&scope, &batch).unwrap_err().is_not_found());
        assert!(db.embeddings.get_message_embeddings(&scope, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_search_messages_orders_by_similarity() {
        let (db, scope) = test_db();
        let messages = seed(&db, &scope, "s1", None);
        let vectors = [vec![1.0, 0.0, 0.0], vec![0.7, 0.7, 0.0], vec![0.0, 0.0, 1.0]];
        let batch: Vec<_> = messages
            .iter()
            .zip(vectors.iter())
            .map(|(m, v)| MessageEmbedding { message_uuid: m.uuid, vector: v.clone() })
            .collect();
        db.embeddings.put_message_embeddings(&scope, &batch).unwrap();
        assert_eq!(db.embeddings.get_message_embeddings(&scope, "s1").unwrap(), batch);

        let options = SearchOptions { limit: 5, min_score: 0.1, mmr_lambda: None };
        let hits = db
            .embeddings
            .search_messages(&scope, &SearchScope::Session("s1".into()), &[1.0, 0.1, 0.0], &options)
            .unwrap();
        // the orthogonal vector falls under the cutoff
        assert_eq!(hits.iter().map(|h| h.uuid).collect::<Vec<_>>(), vec![messages[0].uuid, messages[1].uuid]);

        let err = db
            .embeddings
            .search_messages(&scope, &SearchScope::Session("s1".into()), &[1.0], &options)
            .unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingMismatch { .. }));
    }

    #[test]
    fn test_search_summaries_by_user_scope() {
        let (db, scope) = test_db();
        let first = seed(&db, &scope, "s1", Some("alice"));
        let second = seed(&db, &scope, "s2", Some("alice"));
        let other = seed(&db, &scope, "s3", Some("bob"));

        let mut summaries = Vec::new();
        for (session, messages) in [("s1", &first), ("s2", &second), ("s3", &other)] {
            let summary = db
                .summaries
                .create(
                    &scope,
                    session,
                    &NewSummary {
                        content: format!("summary of {}", session),
                        summary_point_uuid: messages[2].uuid,
                        token_count: 5,
                        metadata: None,
                    },
                )
                .unwrap();
            db.embeddings
                .put_summary_embedding(&scope, &SummaryEmbedding { summary_uuid: summary.uuid, vector: vec![1.0, 0.0, 0.0] })
                .unwrap();
            summaries.push(summary);
        }

        let hits = db
            .embeddings
            .search_summaries(&scope, &SearchScope::User("alice".into()), &[1.0, 0.0, 0.0], &SearchOptions::default())
            .unwrap();
        let found: Vec<Uuid> = hits.iter().map(|h| h.uuid).collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&summaries[0].uuid) && found.contains(&summaries[1].uuid));
    }

    #[test]
    fn test_search_with_mmr_limits_results() {
        let (db, scope) = test_db();
        let messages = seed(&db, &scope, "s1", None);
        let batch: Vec<_> = messages
            .iter()
            .map(|m| MessageEmbedding { message_uuid: m.uuid, vector: vec![1.0, 0.5, 0.1] })
            .collect();
        db.embeddings.put_message_embeddings(&scope, &batch).unwrap();
        let options = SearchOptions { limit: 2, min_score: 0.0, mmr_lambda: Some(0.5) };
        let hits = db
            .embeddings
            .search_messages(&scope, &SearchScope::Session("s1".into()), &[1.0, 0.5, 0.1], &options)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_ne!(hits[0].uuid, hits[1].uuid);
    }
}
