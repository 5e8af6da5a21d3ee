//! Configuration tree for the MIRA gateway.
//!
//! Loaded from TOML; every section has serde defaults so a missing file
//! yields a fully usable development configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub segments: SegmentConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub user: UserConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults when absent.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| crate::Error::Validation(format!("config parse: {e}")))
            }
            _ => Ok(Self::default()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM API
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "d_model")]
    pub model: String,
    /// Cheap, fast model for fingerprints, segment summaries, and
    /// context-trim judgments.
    #[serde(default = "d_utility_model")]
    pub utility_model: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Resolved at boot; env `MIRA_API_KEY` wins over the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "d_context_window")]
    pub context_window_tokens: u64,
    #[serde(default = "d_true")]
    pub enable_prompt_caching: bool,
    #[serde(default)]
    pub extended_thinking: bool,
    #[serde(default = "d_thinking_budget")]
    pub extended_thinking_budget: u32,
    /// Surface generic-provider thinking text to stream consumers.
    #[serde(default)]
    pub show_generic_thinking: bool,
    #[serde(default)]
    pub emergency_fallback_enabled: bool,
    #[serde(default)]
    pub emergency_fallback_endpoint: Option<String>,
    #[serde(default)]
    pub emergency_fallback_model: Option<String>,
    #[serde(default)]
    pub emergency_fallback_api_key: Option<String>,
    #[serde(default = "d_recovery_minutes")]
    pub emergency_fallback_recovery_minutes: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            utility_model: d_utility_model(),
            base_url: d_base_url(),
            api_key: None,
            max_tokens: d_max_tokens(),
            temperature: d_temperature(),
            timeout_secs: d_timeout_secs(),
            context_window_tokens: d_context_window(),
            enable_prompt_caching: true,
            extended_thinking: false,
            extended_thinking_budget: d_thinking_budget(),
            show_generic_thinking: false,
            emergency_fallback_enabled: false,
            emergency_fallback_endpoint: None,
            emergency_fallback_model: None,
            emergency_fallback_api_key: None,
            emergency_fallback_recovery_minutes: d_recovery_minutes(),
        }
    }
}

/// Output ceiling for small-context model families.
pub const HAIKU_MAX_OUTPUT_TOKENS: u32 = 8_192;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context / overflow remediation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Sliding-window size (in messages) for topic-drift detection.
    #[serde(default = "d_3u")]
    pub topic_drift_window_size: usize,
    /// Adjacent-window similarity below which a cut candidate exists.
    #[serde(default = "d_drift_threshold")]
    pub topic_drift_threshold: f32,
    /// Oldest-first prune size when no drift boundary is found.
    #[serde(default = "d_10u")]
    pub overflow_fallback_prune_count: usize,
    #[serde(default = "d_3u")]
    pub max_overflow_retries: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            topic_drift_window_size: 3,
            topic_drift_threshold: d_drift_threshold(),
            overflow_fallback_prune_count: 10,
            max_overflow_retries: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Long-term memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "d_20u")]
    pub retrieval_limit: usize,
    #[serde(default = "d_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "d_text_weight")]
    pub text_weight: f32,
    /// Embeddings service endpoint (encode_realtime / encode_deep).
    #[serde(default = "d_embeddings_url")]
    pub embeddings_url: String,
    #[serde(default = "d_embedding_cache_ttl")]
    pub embedding_cache_ttl_secs: u64,
    /// How deep to walk the memory link graph during retrieval.
    #[serde(default = "d_3u")]
    pub max_link_traversal_depth: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_limit: 20,
            vector_weight: d_vector_weight(),
            text_weight: d_text_weight(),
            embeddings_url: d_embeddings_url(),
            embedding_cache_ttl_secs: d_embedding_cache_ttl(),
            max_link_traversal_depth: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Segments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Minutes of inactivity (relative to the virtual last-message time)
    /// before an active segment collapses.
    #[serde(default = "d_segment_timeout")]
    pub segment_timeout_minutes: i64,
    /// How many recent segments the manifest shows.
    #[serde(default = "d_manifest_limit")]
    pub manifest_limit: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_timeout_minutes: d_segment_timeout(),
            manifest_limit: d_manifest_limit(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP server & inbound limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_image_max_bytes")]
    pub image_max_bytes: usize,
    #[serde(default = "d_document_max_mb")]
    pub document_max_mb: usize,
    #[serde(default = "d_image_mime_allowlist")]
    pub image_mime_allowlist: Vec<String>,
    #[serde(default = "d_document_mime_allowlist")]
    pub document_mime_allowlist: Vec<String>,
    /// Per-user chat lock lease, seconds.
    #[serde(default = "d_chat_lock_ttl")]
    pub chat_lock_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            image_max_bytes: d_image_max_bytes(),
            document_max_mb: d_document_max_mb(),
            image_mime_allowlist: d_image_mime_allowlist(),
            document_mime_allowlist: d_document_mime_allowlist(),
            chat_lock_ttl_secs: d_chat_lock_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory for continuum and memory persistence.
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { path: d_state_path() }
    }
}

/// The assistant's user. MIRA is per-user; multi-tenant deployments run
/// one process per user behind the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Stable identity; generated once and written back when absent.
    #[serde(default)]
    pub id: Option<uuid::Uuid>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default = "d_timezone")]
    pub timezone: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self { id: None, first_name: None, timezone: d_timezone() }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_utility_model() -> String {
    "claude-3-5-haiku-20241022".into()
}
fn d_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_embeddings_url() -> String {
    "http://127.0.0.1:8900".into()
}
fn d_max_tokens() -> u32 {
    8_192
}
fn d_temperature() -> f32 {
    0.7
}
fn d_timeout_secs() -> u64 {
    120
}
fn d_context_window() -> u64 {
    200_000
}
fn d_thinking_budget() -> u32 {
    4_096
}
fn d_recovery_minutes() -> u64 {
    5
}
fn d_true() -> bool {
    true
}
fn d_3u() -> usize {
    3
}
fn d_10u() -> usize {
    10
}
fn d_20u() -> usize {
    20
}
fn d_drift_threshold() -> f32 {
    0.8
}
fn d_vector_weight() -> f32 {
    0.6
}
fn d_text_weight() -> f32 {
    0.4
}
fn d_embedding_cache_ttl() -> u64 {
    900
}
fn d_segment_timeout() -> i64 {
    30
}
fn d_manifest_limit() -> usize {
    12
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3400
}
fn d_image_max_bytes() -> usize {
    5 * 1024 * 1024
}
fn d_document_max_mb() -> usize {
    10
}
fn d_image_mime_allowlist() -> Vec<String> {
    ["image/jpeg", "image/png", "image/gif", "image/webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn d_document_mime_allowlist() -> Vec<String> {
    [
        "application/pdf",
        "text/csv",
        "application/json",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "text/plain",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn d_chat_lock_ttl() -> u64 {
    60
}
fn d_timezone() -> String {
    "UTC".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
