pub mod extractor;
pub mod llm_worker;
pub mod purge_worker;
pub use extractor::{DispatcherSettings, Extractor, ExtractorDispatcher, ExtractorEvent};
pub use llm_worker::{LlmService, LlmWorker};
pub use purge_worker::PurgeWorker;
