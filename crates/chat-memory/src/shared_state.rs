//! Constructor-injected service container.
//!
//! Everything a request needs (database, LLM service, orchestrator, retriever)
//! is built once here and passed down explicitly; nothing is a global.
use crate::config::Config;
use crate::context_engine::{MemoryOrchestrator, MultiQuestionRetriever};
use crate::error::Result;
use crate::memory_db::MemoryDatabase;
use crate::worker_threads::{Extractor, ExtractorDispatcher, LlmService, LlmWorker, PurgeWorker};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct SharedState {
    pub config: Arc<Config>,
    pub database: Arc<MemoryDatabase>,
    pub llm: Arc<dyn LlmService>,
    pub dispatcher: Arc<ExtractorDispatcher>,
    pub orchestrator: Arc<MemoryOrchestrator>,
    pub retriever: Arc<MultiQuestionRetriever>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedState {
    /// Wire the services around already-built collaborators. Must be called
    /// inside a tokio runtime since the extractor workers start here.
    pub fn new(
        config: Config,
        database: Arc<MemoryDatabase>,
        llm: Arc<dyn LlmService>,
        extractors: Vec<Arc<dyn Extractor>>,
    ) -> Self {
        let dispatcher = Arc::new(ExtractorDispatcher::new(extractors, config.dispatcher_settings()));
        let retriever = Arc::new(MultiQuestionRetriever::new(
            Arc::clone(&database),
            Arc::clone(&llm),
            config.multi_question_settings(),
        ));
        let orchestrator = Arc::new(
            MemoryOrchestrator::new(Arc::clone(&database), Arc::clone(&llm), Arc::clone(&dispatcher))
                .with_retriever(Arc::clone(&retriever)),
        );

        Self {
            config: Arc::new(config),
            database,
            llm,
            dispatcher,
            orchestrator,
            retriever,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Open the configured database and HTTP LLM client
    pub fn from_config(config: Config, extractors: Vec<Arc<dyn Extractor>>) -> Result<Self> {
        let database = Arc::new(MemoryDatabase::new(
            Path::new(&config.db_path),
            &config.schema,
            config.database_options(),
        )?);
        let llm: Arc<dyn LlmService> = Arc::new(LlmWorker::from_config(&config)?);
        Ok(Self::new(config, database, llm, extractors))
    }

    /// Token cancelled on shutdown; hand children of it to long-running work
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the purge ticker if it is enabled
    pub async fn start_background(&self) {
        let purge = PurgeWorker::from_minutes(
            Arc::clone(&self.database),
            self.config.purge_interval_minutes,
            self.config.purge_retention(),
        );
        if let Some(handle) = purge.spawn(self.shutdown.child_token()) {
            self.background.lock().await.push(handle);
        }
    }

    /// Cancel background work and wait for it to stop
    pub async fn shutdown(&self) {
        info!("Shutting down memory services");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_context::CallContext;
    use crate::memory_db::test_support::test_options;
    use crate::memory_db::{NewMessage, RoleType};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullLlm;

    #[async_trait]
    impl LlmService for NullLlm {
        async fn call(&self, _ctx: &CallContext, _prompt: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn embed_texts(&self, _ctx: &CallContext, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0, 0.0, 1.0]).collect())
        }
    }

    fn config() -> Config {
        Config::from_lookup(|key| match key {
            "PURGE_INTERVAL_MINUTES" => Some("1".to_string()),
            "EMBEDDING_DIMENSIONS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_services_share_one_database() {
        let database = Arc::new(MemoryDatabase::new_in_memory("state", test_options()).unwrap());
        let state = SharedState::new(config(), Arc::clone(&database), Arc::new(NullLlm), Vec::new());
        let scope = database.scope(Uuid::new_v4());

        state
            .orchestrator
            .put_memory(&scope, "s1", vec![NewMessage::new(RoleType::User, "hi")], false)
            .await
            .unwrap();
        assert_eq!(state.database.sessions.get(&scope, "s1").unwrap().session_id, "s1");
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_work() {
        let database = Arc::new(MemoryDatabase::new_in_memory("state", test_options()).unwrap());
        let state = SharedState::new(config(), database, Arc::new(NullLlm), Vec::new());
        state.start_background().await;
        assert_eq!(state.background.lock().await.len(), 1);

        state.shutdown().await;
        assert!(state.shutdown_token().is_cancelled());
        assert!(state.background.lock().await.is_empty());
    }
}
