use crate::context_engine::MultiQuestionSettings;
use crate::memory_db::{DatabaseOptions, LockPolicy};
use crate::worker_threads::DispatcherSettings;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub schema: String,
    pub embedding_dimensions: usize,
    pub db_pool_size: u32,
    pub llm_base_url: String,
    pub llm_model: String,
    pub embedding_model: String,
    pub llm_max_attempts: u32,
    pub llm_timeout_seconds: u64,
    pub purge_interval_minutes: u64,
    pub purge_retention_hours: u64,
    pub multi_question_count: usize,
    pub multi_question_timeout_seconds: u64,
    pub multi_question_concurrency: usize,
    pub multi_question_min_score: f32,
    pub multi_question_mmr_lambda: f32,
    pub extractor_queue_size: usize,
    pub extractor_max_attempts: u32,
    pub lock_initial_backoff_ms: u64,
    pub lock_max_backoff_ms: u64,
    pub lock_max_attempts: u32,
    pub stale_lock_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // "auto" sizes the retrieval fan-out to the machine
        let multi_question_concurrency = match get("MULTI_QUESTION_CONCURRENCY", "auto").as_str() {
            "auto" => Self::auto_detect_concurrency(),
            raw => parse("MULTI_QUESTION_CONCURRENCY", raw)?,
        };

        let config = Self {
            db_path: get("MEMORY_DB_PATH", "./data/chat_memory.db"),
            schema: get("MEMORY_SCHEMA", "default"),
            embedding_dimensions: parse("EMBEDDING_DIMENSIONS", &get("EMBEDDING_DIMENSIONS", "384"))?,
            db_pool_size: parse("DB_POOL_SIZE", &get("DB_POOL_SIZE", "10"))?,
            llm_base_url: get("LLM_BASE_URL", "http://127.0.0.1:8081"),
            llm_model: get("LLM_MODEL", "local-llm"),
            embedding_model: get("EMBEDDING_MODEL", "local-embedding"),
            llm_max_attempts: parse("LLM_MAX_ATTEMPTS", &get("LLM_MAX_ATTEMPTS", "3"))?,
            llm_timeout_seconds: parse("LLM_TIMEOUT_SECONDS", &get("LLM_TIMEOUT_SECONDS", "120"))?,
            purge_interval_minutes: parse("PURGE_INTERVAL_MINUTES", &get("PURGE_INTERVAL_MINUTES", "60"))?,
            purge_retention_hours: parse("PURGE_RETENTION_HOURS", &get("PURGE_RETENTION_HOURS", "720"))?,
            multi_question_count: parse("MULTI_QUESTION_COUNT", &get("MULTI_QUESTION_COUNT", "3"))?,
            multi_question_timeout_seconds: parse(
                "MULTI_QUESTION_TIMEOUT_SECONDS",
                &get("MULTI_QUESTION_TIMEOUT_SECONDS", "30"),
            )?,
            multi_question_concurrency,
            multi_question_min_score: parse("MULTI_QUESTION_MIN_SCORE", &get("MULTI_QUESTION_MIN_SCORE", "0.7"))?,
            multi_question_mmr_lambda: parse("MULTI_QUESTION_MMR_LAMBDA", &get("MULTI_QUESTION_MMR_LAMBDA", "0.5"))?,
            extractor_queue_size: parse("EXTRACTOR_QUEUE_SIZE", &get("EXTRACTOR_QUEUE_SIZE", "256"))?,
            extractor_max_attempts: parse("EXTRACTOR_MAX_ATTEMPTS", &get("EXTRACTOR_MAX_ATTEMPTS", "3"))?,
            lock_initial_backoff_ms: parse("LOCK_INITIAL_BACKOFF_MS", &get("LOCK_INITIAL_BACKOFF_MS", "200"))?,
            lock_max_backoff_ms: parse("LOCK_MAX_BACKOFF_MS", &get("LOCK_MAX_BACKOFF_MS", "30000"))?,
            lock_max_attempts: parse("LOCK_MAX_ATTEMPTS", &get("LOCK_MAX_ATTEMPTS", "15"))?,
            stale_lock_seconds: parse("STALE_LOCK_SECONDS", &get("STALE_LOCK_SECONDS", "300"))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            anyhow::bail!("EMBEDDING_DIMENSIONS must be greater than zero");
        }
        if self.schema.trim().is_empty() {
            anyhow::bail!("MEMORY_SCHEMA cannot be empty");
        }
        if !(0.0..=1.0).contains(&self.multi_question_mmr_lambda) {
            anyhow::bail!("MULTI_QUESTION_MMR_LAMBDA must be within [0, 1]");
        }
        Ok(())
    }

    fn auto_detect_concurrency() -> usize {
        let cpus = num_cpus::get();
        info!("Auto-detected CPU cores: {}", cpus);
        cpus.clamp(1, 8)
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            embedding_dimensions: self.embedding_dimensions,
            lock_policy: LockPolicy {
                initial_backoff: Duration::from_millis(self.lock_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.lock_max_backoff_ms),
                max_attempts: self.lock_max_attempts,
            },
            stale_lock_after: Duration::from_secs(self.stale_lock_seconds),
            pool_size: self.db_pool_size,
        }
    }

    pub fn multi_question_settings(&self) -> MultiQuestionSettings {
        MultiQuestionSettings {
            question_count: self.multi_question_count,
            concurrency: self.multi_question_concurrency,
            timeout: Duration::from_secs(self.multi_question_timeout_seconds),
            min_score: self.multi_question_min_score,
            mmr_lambda: self.multi_question_mmr_lambda,
            ..Default::default()
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            queue_size: self.extractor_queue_size,
            max_attempts: self.extractor_max_attempts,
            ..Default::default()
        }
    }

    pub fn purge_retention(&self) -> Duration {
        Duration::from_secs(self.purge_retention_hours * 3600)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {} (schema '{}')", self.db_path, self.schema);
        info!("- Embedding Dimensions: {}", self.embedding_dimensions);
        info!("- LLM Backend: {}", self.llm_base_url);
        info!("- LLM Model: {} / Embeddings: {}", self.llm_model, self.embedding_model);
        info!("- LLM Attempts: {} ({}s timeout)", self.llm_max_attempts, self.llm_timeout_seconds);
        if self.purge_interval_minutes == 0 {
            info!("- Purge: disabled");
        } else {
            info!(
                "- Purge: every {} min, retention {} h",
                self.purge_interval_minutes, self.purge_retention_hours
            );
        }
        info!(
            "- Multi-Question: {} questions, {} concurrent, {}s timeout",
            self.multi_question_count, self.multi_question_concurrency, self.multi_question_timeout_seconds
        );
        info!("- Extractor Queue Size: {}", self.extractor_queue_size);
        info!(
            "- Lock Backoff: {}ms..{}ms, {} attempts",
            self.lock_initial_backoff_ms, self.lock_max_backoff_ms, self.lock_max_attempts
        );
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value '{}' for {}", raw, key))
}
