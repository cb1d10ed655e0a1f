mod common;

use chat_memory::context_engine::MultiQuestionSettings;
use chat_memory::memory_db::{
    CreateSessionRequest, MessageEmbedding, NewSummary, SearchOptions, SearchScope, SummaryEmbedding,
};
use chat_memory::{CallContext, MemoryError, MultiQuestionRetriever};
use common::{conversation, file_db, ScriptedLlm, DIMENSIONS};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[test]
fn mismatched_embedding_width_leaves_no_rows() {
    let (_dir, db, scope) = file_db();
    db.sessions
        .create(&scope, &CreateSessionRequest { session_id: "s1".into(), ..Default::default() })
        .unwrap();
    let stored = db.messages.create_many(&scope, "s1", &conversation(2)).unwrap();

    let batch = vec![
        MessageEmbedding { message_uuid: stored[0].uuid, vector: vec![0.1; DIMENSIONS] },
        MessageEmbedding { message_uuid: stored[1].uuid, vector: vec![0.1; DIMENSIONS + 1] },
    ];
    let err = db.embeddings.put_message_embeddings(&scope, &batch).unwrap_err();
    assert!(matches!(err, MemoryError::EmbeddingMismatch { expected: DIMENSIONS, found } if found == DIMENSIONS + 1));
    assert!(err.to_string().contains("configured dimensions must match"));

    assert!(db.embeddings.get_message_embeddings(&scope, "s1").unwrap().is_empty());
    assert_eq!(db.embeddings.get_stats().unwrap().message_embeddings, 0);
}

#[test]
fn user_scope_searches_across_sessions() {
    let (_dir, db, scope) = file_db();
    for session in ["a", "b"] {
        db.sessions
            .create(
                &scope,
                &CreateSessionRequest { session_id: session.into(), user_id: Some("u1".into()), ..Default::default() },
            )
            .unwrap();
        let stored = db.messages.create_many(&scope, session, &conversation(1)).unwrap();
        db.embeddings
            .put_message_embeddings(&scope, &[MessageEmbedding { message_uuid: stored[0].uuid, vector: vec![1.0, 0.0, 0.0] }])
            .unwrap();
    }

    let options = SearchOptions::default();
    let by_user = db
        .embeddings
        .search_messages(&scope, &SearchScope::User("u1".into()), &[1.0, 0.0, 0.0], &options)
        .unwrap();
    let by_session = db
        .embeddings
        .search_messages(&scope, &SearchScope::Session("a".into()), &[1.0, 0.0, 0.0], &options)
        .unwrap();
    assert_eq!(by_user.len(), 2);
    assert_eq!(by_session.len(), 1);
}

fn seeded_summaries(
    vectors: &[[f32; 3]],
) -> (tempfile::TempDir, Arc<chat_memory::MemoryDatabase>, chat_memory::TenantScope, Vec<chat_memory::memory_db::Message>) {
    let (dir, db, scope) = file_db();
    db.sessions
        .create(&scope, &CreateSessionRequest { session_id: "s1".into(), ..Default::default() })
        .unwrap();
    let history = db.messages.create_many(&scope, "s1", &conversation(4)).unwrap();
    for (i, vector) in vectors.iter().enumerate() {
        let summary = db
            .summaries
            .create(
                &scope,
                "s1",
                &NewSummary {
                    content: format!("summary {}", i),
                    summary_point_uuid: history[i % history.len()].uuid,
                    token_count: 2,
                    metadata: None,
                },
            )
            .unwrap();
        db.embeddings
            .put_summary_embedding(&scope, &SummaryEmbedding { summary_uuid: summary.uuid, vector: vector.to_vec() })
            .unwrap();
    }
    (dir, db, scope, history)
}

fn settings() -> MultiQuestionSettings {
    MultiQuestionSettings {
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn zero_generated_questions_is_an_explicit_error() {
    let (_dir, db, scope, history) = seeded_summaries(&[[1.0, 0.0, 0.0]]);
    let llm = ScriptedLlm::new("I could not think of anything.", vec![1.0, 0.0, 0.0]);
    let retriever = MultiQuestionRetriever::new(db, llm.clone(), settings());

    let err = retriever
        .retrieve(&CallContext::new(), &scope, "s1", &history, 3)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no questions generated"));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn several_hits_are_reduced_by_a_second_call() {
    let (_dir, db, scope, history) = seeded_summaries(&[[1.0, 0.0, 0.0], [0.95, 0.05, 0.0], [0.0, 0.0, 1.0]]);
    let llm = ScriptedLlm::new("<questions>\nwhere?\nwhen?\n</questions>", vec![1.0, 0.0, 0.0]);
    let retriever = MultiQuestionRetriever::new(db, llm.clone(), settings());

    let found = retriever
        .retrieve(&CallContext::new(), &scope, "s1", &history, 2)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "consolidated");
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn a_single_hit_skips_the_reduce_call() {
    let (_dir, db, scope, history) = seeded_summaries(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
    let llm = ScriptedLlm::new("<questions>where?</questions>", vec![1.0, 0.0, 0.0]);
    let retriever = MultiQuestionRetriever::new(db, llm.clone(), settings());

    let found = retriever
        .retrieve(&CallContext::new(), &scope, "s1", &history, 1)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "summary 0");
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn cancelled_parent_aborts_retrieval() {
    let (_dir, db, scope, history) = seeded_summaries(&[[1.0, 0.0, 0.0]]);
    let llm = ScriptedLlm::new("<questions>where?</questions>", vec![1.0, 0.0, 0.0]);
    let retriever = MultiQuestionRetriever::new(db, llm, settings());

    let ctx = CallContext::new();
    ctx.cancel();
    let err = retriever.retrieve(&ctx, &scope, "s1", &history, 1).await.unwrap_err();
    assert!(matches!(err, MemoryError::Cancelled));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (_dir, db, scope, history) = seeded_summaries(&[]);
    let llm = ScriptedLlm::new("<questions>where?</questions>", vec![1.0, 0.0, 0.0]);
    let retriever = MultiQuestionRetriever::new(db, llm, settings());
    let err = retriever
        .retrieve(&CallContext::new(), &scope, &Uuid::new_v4().to_string(), &history, 1)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
