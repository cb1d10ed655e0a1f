//! Context engine: windowed memory, fused search and multi-question retrieval

pub mod fusion;
pub mod multi_question;
pub mod orchestrator;
pub mod similarity;

pub use fusion::{reciprocal_rank_fusion, FusedItem};
pub use multi_question::{MultiQuestionRetriever, MultiQuestionSettings};
pub use orchestrator::{MemoryOrchestrator, MemoryWindow};
pub use similarity::{cosine_similarity, maximal_marginal_relevance};
