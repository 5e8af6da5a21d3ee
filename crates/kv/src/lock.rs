//! Per-user chat lock.
//!
//! At most one in-flight turn per user, enforced by a leased
//! `chat_lock:{user_id}` key with a TTL so a crashed turn cannot wedge the
//! user. A second request while the lease is held is rejected rather than
//! queued.

use std::sync::Arc;
use uuid::Uuid;

use mira_domain::{Error, Result};

use crate::store::KvStore;
use crate::KEY_CHAT_LOCK;

/// Acquires and releases per-user turn leases.
pub struct ChatLock {
    kv: Arc<KvStore>,
    ttl_secs: u64,
}

impl ChatLock {
    pub fn new(kv: Arc<KvStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    /// Take the lease for a user. Fails with a validation-level error when
    /// another turn is already in flight.
    pub fn acquire(&self, user_id: &Uuid) -> Result<ChatLockGuard> {
        let key = format!("{KEY_CHAT_LOCK}{user_id}");
        let token = Uuid::new_v4().to_string();
        if !self.kv.set(&key, &token, true, Some(self.ttl_secs)) {
            return Err(Error::Validation(
                "another chat request is in progress".into(),
            ));
        }
        Ok(ChatLockGuard { kv: Arc::clone(&self.kv), key, token })
    }
}

/// Releases the lease on drop (guaranteed-cleanup path), but only if the
/// lease token is still ours — an expired-and-reacquired lease belongs to
/// the newer turn.
#[derive(Debug)]
pub struct ChatLockGuard {
    kv: Arc<KvStore>,
    key: String,
    token: String,
}

impl Drop for ChatLockGuard {
    fn drop(&mut self) {
        if self.kv.get(&self.key).as_deref() == Some(self.token.as_str()) {
            self.kv.delete(&self.key);
        }
    }
}
