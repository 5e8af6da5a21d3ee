//! The KV store: string keys, hashes, JSON documents, TTLs, and a
//! background listener that fires registered handlers shortly before a key
//! expires (via `{key}:warning` twins).
//!
//! Expiry is enforced both lazily on access and by the background sweep, so
//! reads never observe a stale value regardless of sweep cadence.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mira_domain::{Error, Result};

/// Interval between background expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Suffix for expiry-warning twin keys.
const WARNING_SUFFIX: &str = ":warning";

enum Stored {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

type ExpiryHandler = Arc<dyn Fn(&str, Option<String>) + Send + Sync>;

struct Inner {
    entries: HashMap<String, Entry>,
    /// Prefix → handler; dispatched when a `{key}:warning` twin expires.
    handlers: Vec<(String, ExpiryHandler)>,
}

/// In-process TTL'd key/value store with hash and JSON-path operations.
pub struct KvStore {
    inner: Arc<Mutex<Inner>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { entries: HashMap::new(), handlers: Vec::new() })),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background expiry listener. Idempotent.
    pub fn start_ttl_listener(&self) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                sweep(&inner);
            }
        }));
        tracing::debug!("kv ttl listener started");
    }

    /// Stop the background listener and drop all state.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.inner.lock().entries.clear();
    }

    // ── String keys ────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.entries.get(key).map(|e| e.expired()).unwrap_or(false) {
            inner.entries.remove(key);
            return None;
        }
        match inner.entries.get(key) {
            Some(Entry { value: Stored::Str(s), .. }) => Some(s.clone()),
            _ => None,
        }
    }

    /// Set a key. `nx` makes the write conditional on absence; `ex` sets a
    /// TTL in seconds. Returns false when `nx` blocked the write.
    pub fn set(&self, key: &str, value: &str, nx: bool, ex: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        let live = inner
            .entries
            .get(key)
            .map(|e| !e.expired())
            .unwrap_or(false);
        if nx && live {
            return false;
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: ex.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        true
    }

    pub fn setex(&self, key: &str, seconds: u64, value: &str) {
        self.set(key, value, false, Some(seconds));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get_any(key)
    }

    /// Seconds until expiry: -2 when the key is absent, -1 when it has no
    /// TTL (Valkey convention).
    pub fn ttl(&self, key: &str) -> i64 {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            None => -2,
            Some(e) if e.expired() => {
                inner.entries.remove(key);
                -2
            }
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry { expires_at: Some(t), .. }) => {
                t.saturating_duration_since(Instant::now()).as_secs() as i64
            }
        }
    }

    pub fn expire(&self, key: &str, seconds: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(e) if !e.expired() => {
                e.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                true
            }
            _ => false,
        }
    }

    /// Keys matching a `prefix*`-style pattern (prefix match only).
    pub fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired())
            .map(|(k, _)| k.clone())
            .collect()
    }

    // ── Hashes ─────────────────────────────────────────────────────

    pub fn hset(&self, hash_key: &str, field: &str, value: &str) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .entry(hash_key.to_string())
            .or_insert_with(|| Entry { value: Stored::Hash(HashMap::new()), expires_at: None });
        if entry.expired() {
            entry.value = Stored::Hash(HashMap::new());
            entry.expires_at = None;
        }
        if let Stored::Hash(h) = &mut entry.value {
            h.insert(field.to_string(), value.to_string());
        } else {
            entry.value = Stored::Hash(HashMap::from([(field.to_string(), value.to_string())]));
        }
    }

    pub fn hget(&self, hash_key: &str, field: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.entries.get(hash_key).map(|e| e.expired()).unwrap_or(false) {
            inner.entries.remove(hash_key);
            return None;
        }
        match inner.entries.get(hash_key) {
            Some(Entry { value: Stored::Hash(h), .. }) => h.get(field).cloned(),
            _ => None,
        }
    }

    pub fn hgetall(&self, hash_key: &str) -> HashMap<String, String> {
        let mut inner = self.inner.lock();
        if inner.entries.get(hash_key).map(|e| e.expired()).unwrap_or(false) {
            inner.entries.remove(hash_key);
            return HashMap::new();
        }
        match inner.entries.get(hash_key) {
            Some(Entry { value: Stored::Hash(h), .. }) => h.clone(),
            _ => HashMap::new(),
        }
    }

    pub fn hdel(&self, hash_key: &str, fields: &[&str]) -> usize {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(hash_key) {
            Some(Entry { value: Stored::Hash(h), .. }) => {
                fields.iter().filter(|f| h.remove(**f).is_some()).count()
            }
            _ => 0,
        }
    }

    // ── JSON documents ─────────────────────────────────────────────

    /// Set JSON data. Path `"$"` replaces the whole value; `"$.field"`
    /// updates one field via read-modify-write, preserving the existing TTL
    /// when `ex` is not given. Field updates on a missing key return false.
    pub fn json_set(&self, key: &str, path: &str, value: &Value, ex: Option<u64>) -> Result<bool> {
        if path == "$" {
            let raw = serde_json::to_string(value)?;
            self.set(key, &raw, false, ex);
            return Ok(true);
        }

        let field = path
            .strip_prefix("$.")
            .ok_or_else(|| Error::Validation(format!("unsupported JSON path: {path}")))?;

        let Some(current) = self.get(key) else {
            return Ok(false);
        };
        let mut doc: Value = serde_json::from_str(&current)?;
        if !doc.is_object() {
            return Err(Error::Validation(format!("key {key} does not hold a JSON object")));
        }
        doc[field] = value.clone();

        let effective_ex = match ex {
            Some(e) => Some(e),
            None => {
                let remaining = self.ttl(key);
                (remaining > 0).then_some(remaining as u64)
            }
        };
        let raw = serde_json::to_string(&doc)?;
        self.set(key, &raw, false, effective_ex);
        Ok(true)
    }

    pub fn json_get(&self, key: &str) -> Result<Option<Value>> {
        match self.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ── Expiry warnings ────────────────────────────────────────────

    /// Register a handler for keys under `key_prefix`; fired (with the main
    /// key's current value) when the key's warning twin expires.
    pub fn register_ttl_handler<F>(&self, key_prefix: &str, handler: F)
    where
        F: Fn(&str, Option<String>) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .handlers
            .push((key_prefix.to_string(), Arc::new(handler)));
        tracing::debug!(prefix = key_prefix, "registered kv expiry handler");
    }

    /// Set a TTL on `main_key` and store a `{main_key}:warning` twin that
    /// expires `warning_offset` seconds earlier, triggering persistence
    /// handlers while the main value is still readable.
    pub fn set_ttl_with_warning(&self, main_key: &str, ttl_seconds: u64, warning_offset: u64) {
        self.expire(main_key, ttl_seconds);
        let warning_ttl = ttl_seconds.saturating_sub(warning_offset).max(1);
        self.set(&format!("{main_key}{WARNING_SUFFIX}"), "1", false, Some(warning_ttl));
    }

    fn get_any(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.get(key).map(|e| e.expired()).unwrap_or(false) {
            inner.entries.remove(key);
            return false;
        }
        inner.entries.contains_key(key)
    }
}

/// One background sweep: drop expired entries and dispatch warning handlers.
fn sweep(inner: &Arc<Mutex<Inner>>) {
    // Collect under the lock, dispatch outside it: handlers may call back
    // into the store.
    let (fired, handlers): (Vec<(String, Option<String>)>, Vec<(String, ExpiryHandler)>) = {
        let mut guard = inner.lock();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();

        let mut fired = Vec::new();
        for key in expired {
            guard.entries.remove(&key);
            if let Some(main_key) = key.strip_suffix(WARNING_SUFFIX) {
                let value = match guard.entries.get(main_key) {
                    Some(Entry { value: Stored::Str(s), .. }) => Some(s.clone()),
                    _ => None,
                };
                fired.push((main_key.to_string(), value));
            }
        }
        (fired, guard.handlers.clone())
    };

    for (main_key, value) in fired {
        for (prefix, handler) in &handlers {
            if main_key.starts_with(prefix.as_str()) {
                handler(&main_key, value.clone());
            }
        }
    }
}
