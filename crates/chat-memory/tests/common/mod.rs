#![allow(dead_code)]

use async_trait::async_trait;
use chat_memory::memory_db::{DatabaseOptions, LockPolicy, NewMessage, RoleType};
use chat_memory::{CallContext, LlmService, MemoryDatabase, Result, TenantScope};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const DIMENSIONS: usize = 3;

pub fn options() -> DatabaseOptions {
    DatabaseOptions {
        embedding_dimensions: DIMENSIONS,
        lock_policy: LockPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(25),
            max_attempts: 400,
        },
        ..Default::default()
    }
}

/// File-backed database so several pooled connections contend for real
pub fn file_db() -> (TempDir, Arc<MemoryDatabase>, TenantScope) {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new(&dir.path().join("memory.db"), "it", options()).unwrap();
    let scope = db.scope(Uuid::new_v4());
    (dir, Arc::new(db), scope)
}

pub fn conversation(n: usize) -> Vec<NewMessage> {
    (0..n)
        .map(|i| {
            let role = if i % 2 == 0 { RoleType::User } else { RoleType::Assistant };
            NewMessage::new(role, format!("message {}", i + 1))
        })
        .collect()
}

/// Scripted LLM: fixed completion, fixed embedding for every text
pub struct ScriptedLlm {
    pub completion: String,
    pub reduce_completion: String,
    pub vector: Vec<f32>,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(completion: &str, vector: Vec<f32>) -> Arc<Self> {
        Arc::new(Self {
            completion: completion.to_string(),
            reduce_completion: "consolidated".to_string(),
            vector,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn call(&self, _ctx: &CallContext, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("<chat_history>") {
            Ok(self.completion.clone())
        } else {
            Ok(self.reduce_completion.clone())
        }
    }

    async fn embed_texts(&self, _ctx: &CallContext, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }
}
