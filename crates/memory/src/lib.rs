//! Long-term memory surfacing: records, embeddings, hybrid relevance
//! search, and the per-turn fingerprint generator.

pub mod embeddings;
pub mod entity_weights;
pub mod fingerprint;
pub mod relevance;
pub mod types;

pub use embeddings::{CachedEmbeddings, Embeddings, HttpEmbeddings, EMBEDDING_DIM};
pub use fingerprint::{ConversationSnippet, FingerprintGenerator};
pub use relevance::{
    cluster_for_display, merge_memories, InMemoryStore, MemoryEntity, MemoryRelevanceService,
    MemoryStore, ScoredMemory, StoredMemory,
};
pub use types::{ConfidenceTier, LinkMetadata, LinkedMemory, MemoryRecord};
