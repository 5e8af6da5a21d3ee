//! Application state: every service wired once at boot.
//!
//! Services are process singletons (they own pools and tuner state);
//! request paths only read this locator and never construct lazily.

use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use mira_continuum::{ContinuumRepository, SegmentService};
use mira_domain::config::Config;
use mira_domain::message::UserContext;
use mira_domain::Result;
use mira_kv::{ChatLock, KvStore};
use mira_memory::{
    CachedEmbeddings, Embeddings, FingerprintGenerator, HttpEmbeddings, InMemoryStore,
    MemoryRelevanceService,
};
use mira_providers::{LlmClient, LlmProvider};
use mira_tools::ToolRegistry;
use mira_working_memory::{
    DomainDocStore, DomainDocTrinket, EventBus, ManifestTrinket, ProactiveMemoryTrinket,
    ReminderManager, ReminderStore, TimeManager, ToolGuidanceTrinket, Trinket, WorkingMemory,
};

use crate::orchestrator::Orchestrator;

/// Base system prompt; the working memory substitutes the user's first
/// name for "The User" at compose time.
pub const BASE_PROMPT: &str = "You are MIRA, The User's personal AI assistant. You are \
    attentive, concise, and proactive. You remember what matters to The User across \
    conversations and bring it up when relevant. When you reference a surfaced memory in \
    your reply, cite its id (for example mem_1a2b3c4d). If something is worth feeling \
    something about, you may include a <mira:my_emotion>…</mira:my_emotion> tag.";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

pub struct AppInner {
    pub cfg: Config,
    pub bus: Arc<EventBus>,
    pub kv: Arc<KvStore>,
    pub repo: Arc<ContinuumRepository>,
    pub working_memory: Arc<WorkingMemory>,
    pub proactive_memory: Arc<ProactiveMemoryTrinket>,
    pub tool_registry: Arc<ToolRegistry>,
    pub llm: Arc<dyn LlmClient>,
    pub embeddings: Arc<dyn Embeddings>,
    pub memory_store: Arc<InMemoryStore>,
    pub relevance: Arc<MemoryRelevanceService>,
    pub orchestrator: Arc<Orchestrator>,
    pub segments: Arc<SegmentService>,
    pub chat_lock: Arc<ChatLock>,
    pub reminders: Arc<ReminderStore>,
    pub domaindocs: Arc<DomainDocStore>,
    pub user: UserContext,
    pub started_at: Instant,
}

impl std::ops::Deref for AppState {
    type Target = AppInner;
    fn deref(&self) -> &AppInner {
        &self.inner
    }
}

impl AppState {
    /// Wire the full service graph from configuration.
    pub fn build(mut cfg: Config) -> Result<AppState> {
        // Resolve the API key from the environment when the file omits it.
        if cfg.api.api_key.is_none() {
            cfg.api.api_key = std::env::var("MIRA_API_KEY").ok().filter(|k| !k.is_empty());
        }

        let user = UserContext {
            user_id: cfg.user.id.unwrap_or_else(Uuid::new_v4),
            first_name: cfg.user.first_name.clone(),
            timezone: cfg.user.timezone.clone(),
        };

        let bus = Arc::new(EventBus::new());
        let kv = Arc::new(KvStore::new());
        let repo = Arc::new(ContinuumRepository::new(cfg.state.path.clone())?);

        let tool_registry = ToolRegistry::with_loader();
        let llm: Arc<dyn LlmClient> = Arc::new(LlmProvider::new(
            cfg.api.clone(),
            Some(Arc::clone(&tool_registry)),
        )?);

        let http_embeddings = Arc::new(HttpEmbeddings::new(cfg.memory.embeddings_url.clone())?);
        let embeddings: Arc<dyn Embeddings> = Arc::new(CachedEmbeddings::new(
            http_embeddings,
            Arc::clone(&kv),
            cfg.memory.embedding_cache_ttl_secs,
        ));

        let memory_store = Arc::new(InMemoryStore::new());
        let relevance = Arc::new(MemoryRelevanceService::new(
            Arc::clone(&memory_store) as Arc<dyn mira_memory::MemoryStore>,
            cfg.memory.vector_weight,
            cfg.memory.text_weight,
            cfg.memory.max_link_traversal_depth,
        ));
        let fingerprint = Arc::new(FingerprintGenerator::new(
            Arc::clone(&llm),
            cfg.api.utility_model.clone(),
        ));

        // Working memory and trinkets.
        let working_memory = WorkingMemory::new(Arc::clone(&bus), Arc::clone(&kv));
        let proactive_memory = Arc::new(ProactiveMemoryTrinket::new());
        let reminders = Arc::new(ReminderStore::new());
        let domaindocs = Arc::new(DomainDocStore::new());
        working_memory.register_trinket(Arc::new(TimeManager));
        working_memory.register_trinket(Arc::new(ManifestTrinket::new(
            Arc::clone(&repo),
            cfg.segments.manifest_limit,
        )));
        working_memory.register_trinket(Arc::new(ReminderManager::new(Arc::clone(&reminders))));
        working_memory
            .register_trinket(Arc::new(ToolGuidanceTrinket::new(Arc::clone(&tool_registry))));
        working_memory
            .register_trinket(Arc::new(DomainDocTrinket::new(Arc::clone(&domaindocs))));
        working_memory.register_trinket(Arc::clone(&proactive_memory) as Arc<dyn Trinket>);

        let segments = Arc::new(SegmentService::new(
            Arc::clone(&llm),
            Arc::clone(&embeddings),
            cfg.api.utility_model.clone(),
            cfg.segments.segment_timeout_minutes,
        ));

        let chat_lock = Arc::new(ChatLock::new(Arc::clone(&kv), cfg.server.chat_lock_ttl_secs));

        let orchestrator = Arc::new(Orchestrator::new(
            cfg.clone(),
            Arc::clone(&llm),
            Arc::clone(&repo),
            Arc::clone(&bus),
            Arc::clone(&working_memory),
            Arc::clone(&proactive_memory),
            Arc::clone(&tool_registry),
            Arc::clone(&fingerprint),
            Arc::clone(&relevance),
            Arc::clone(&embeddings),
            Arc::clone(&kv),
            None,
        ));

        Ok(AppState {
            inner: Arc::new(AppInner {
                cfg,
                bus,
                kv,
                repo,
                working_memory,
                proactive_memory,
                tool_registry,
                llm,
                embeddings,
                memory_store,
                relevance,
                orchestrator,
                segments,
                chat_lock,
                reminders,
                domaindocs,
                user,
                started_at: Instant::now(),
            }),
        })
    }

    /// Background maintenance: the KV TTL listener plus the segment
    /// collapse sweeper.
    pub fn spawn_background_tasks(&self) {
        self.kv.start_ttl_listener();

        let state = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                state.sweep_due_segments().await;
            }
        });
    }

    async fn sweep_due_segments(&self) {
        let now = chrono::Utc::now();
        for user_id in self.repo.cached_users() {
            let Ok(mut continuum) = self.repo.load_or_create(user_id) else {
                continue;
            };
            if !self.segments.collapse_due(&continuum, now) {
                continue;
            }
            match self.segments.collapse(&mut continuum).await {
                Ok(outcome) => {
                    if let Err(e) = self.repo.persist(&continuum) {
                        tracing::warn!(%user_id, error = %e, "failed to persist collapsed segment");
                    }
                    tracing::info!(
                        %user_id,
                        segment_id = %outcome.segment_id,
                        title = %outcome.display_title,
                        "idle segment collapsed"
                    );
                }
                Err(e) => {
                    tracing::warn!(%user_id, error = %e, "segment collapse failed");
                }
            }
        }
    }
}
