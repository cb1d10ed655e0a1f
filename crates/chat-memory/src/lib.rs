//! Persistent conversational memory: sessions, messages, summaries and
//! embeddings in SQLite, with windowed and semantic retrieval on top.

pub mod call_context;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod shared_state;
pub mod telemetry;
pub mod worker_threads;

// Public API exports
pub use call_context::CallContext;
pub use config::Config;
pub use context_engine::{MemoryOrchestrator, MultiQuestionRetriever};
pub use error::{MemoryError, Result};
pub use memory::{Fact, Memory, MessagePayload, SessionSearchResult};
pub use memory_db::{MemoryDatabase, TenantScope};
pub use shared_state::SharedState;
pub use worker_threads::{Extractor, ExtractorEvent, LlmService};
