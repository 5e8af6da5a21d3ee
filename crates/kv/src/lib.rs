//! Short-lived state store with the Valkey operation surface the core uses.
//!
//! The store is in-process (TTL'd keys, hashes, JSON documents, expiry
//! warnings) so the orchestration core has no hard network dependency; a
//! networked Valkey can stand behind the same type without touching callers.

pub mod lock;
pub mod store;

pub use lock::{ChatLock, ChatLockGuard};
pub use store::KvStore;

/// Key prefixes used by the core.
pub const KEY_CONTAINER: &str = "container:";
pub const KEY_TRINKETS: &str = "trinkets:";
pub const KEY_CHAT_LOCK: &str = "chat_lock:";
pub const KEY_EMBEDDING_QUERY: &str = "embedding_768_query:";
pub const KEY_EMBEDDING_DOC: &str = "embedding_768_doc:";
