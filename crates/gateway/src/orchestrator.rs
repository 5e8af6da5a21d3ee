//! The continuum orchestrator: one user turn, end to end.
//!
//! Sequences memory surfacing, prompt composition, the provider call with
//! overflow remediation, tag parsing, persistence, and auto-continuation.
//! `process_message` is the single public entry point.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use mira_continuum::{Continuum, ContinuumDelta, ContinuumRepository, UnitOfWork};
use mira_domain::config::Config;
use mira_domain::message::{
    ApiMessage, ContentBlock, MessageContent, MessageMetadata, ProviderMessage, Role, UserContext,
};
use mira_domain::stream::StreamEvent;
use mira_domain::tags::{match_memory_id, parse_response};
use mira_domain::tool::{is_server_side_tool, CODE_EXECUTION_TOOL_NAME, TOOL_LOADER_NAME};
use mira_domain::{Error, Result};
use mira_kv::{KvStore, KEY_CONTAINER};
use mira_memory::{
    merge_memories, ConversationSnippet, Embeddings, FingerprintGenerator, MemoryRecord,
    MemoryRelevanceService,
};
use mira_providers::{GenerateRequest, LlmClient};
use mira_tools::ToolRegistry;
use mira_working_memory::{
    ContinuumEvent, EventBus, ProactiveMemoryTrinket, TrinketContext, WorkingMemory,
};

use crate::overflow::{
    self, estimate_request_tokens, prune_by_topic_drift, prune_oldest_first, MemoryEvacuator,
    PendingTrims,
};

/// Opening delimiter for the notification-center assistant message.
const HUD_DELIMITER: &str =
    "═══════════════════════════ HUD ════════════════════════════";

/// Synthetic user message driving auto-continuation after a tool load.
const CONTINUATION_MESSAGE: &str = "Great, the tool is now available. Please proceed with \
                                    completing the original task using the newly loaded tool.";

/// Shown when a model tool error left the response blank.
const MODEL_ERROR_APOLOGY: &str = "I encountered an issue with this request. The AI model made \
                                   an invalid tool call that couldn't be corrected. This is a \
                                   limitation of the model, not MIRA. Please try rephrasing \
                                   your request.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs / outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ProcessParams {
    pub user: UserContext,
    /// Inference-tier content (images at ~1200px).
    pub user_message: MessageContent,
    /// Storage-tier content (images at ~512px WebP). Required whenever the
    /// user content carries images.
    pub storage_content: Option<MessageContent>,
    pub system_prompt: String,
    pub segment_turn_number: u32,
    pub events: Option<mpsc::Sender<StreamEvent>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TurnMetadata {
    pub tools_used: Vec<String>,
    pub referenced_memories: Vec<Uuid>,
    pub surfaced_memories: Vec<Uuid>,
    pub pinned_memory_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub model_error: bool,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    pub metadata: TurnMetadata,
}

/// What the event collector learned while the stream ran.
struct StreamObservations {
    tools_used: Vec<String>,
    invoked_tool_loader: bool,
    breaker_tool_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    cfg: Config,
    llm: Arc<dyn LlmClient>,
    repo: Arc<ContinuumRepository>,
    bus: Arc<EventBus>,
    working_memory: Arc<WorkingMemory>,
    proactive_memory: Arc<ProactiveMemoryTrinket>,
    tool_registry: Arc<ToolRegistry>,
    fingerprint: Arc<FingerprintGenerator>,
    relevance: Arc<MemoryRelevanceService>,
    embeddings: Arc<dyn Embeddings>,
    kv: Arc<KvStore>,
    evacuator: Option<Arc<dyn MemoryEvacuator>>,
    /// Actual input tokens from the previous turn, for estimation.
    last_turn_usage: Mutex<HashMap<Uuid, u32>>,
    /// One-shot trims decided by the async judgment.
    pending_context_trim: PendingTrims,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        cfg: Config,
        llm: Arc<dyn LlmClient>,
        repo: Arc<ContinuumRepository>,
        bus: Arc<EventBus>,
        working_memory: Arc<WorkingMemory>,
        proactive_memory: Arc<ProactiveMemoryTrinket>,
        tool_registry: Arc<ToolRegistry>,
        fingerprint: Arc<FingerprintGenerator>,
        relevance: Arc<MemoryRelevanceService>,
        embeddings: Arc<dyn Embeddings>,
        kv: Arc<KvStore>,
        evacuator: Option<Arc<dyn MemoryEvacuator>>,
    ) -> Self {
        tracing::info!("orchestrator initialized");
        Self {
            cfg,
            llm,
            repo,
            bus,
            working_memory,
            proactive_memory,
            tool_registry,
            fingerprint,
            relevance,
            embeddings,
            kv,
            evacuator,
            last_turn_usage: Mutex::new(HashMap::new()),
            pending_context_trim: PendingTrims::default(),
        }
    }

    /// Process one user message through the complete continuum flow.
    ///
    /// Appends both turn messages to the in-memory continuum and commits
    /// the unit of work at the end; a failure anywhere leaves nothing
    /// durable. Auto-continues once when the model loaded a tool mid-turn.
    pub async fn process_message(
        &self,
        continuum: &mut Continuum,
        params: ProcessParams,
    ) -> Result<TurnOutcome> {
        let started = Instant::now();
        let mut uow = UnitOfWork::new();

        let mut message = params.user_message.clone();
        let mut storage = params.storage_content.clone();
        let mut tried_loading_all_tools = false;

        let mut outcome = loop {
            let (outcome, invoked_loader) = self
                .run_turn(continuum, &params, message, storage, &mut uow)
                .await?;

            if invoked_loader && !tried_loading_all_tools {
                tracing::info!("auto-continuing after tool loading");
                tried_loading_all_tools = true;
                message = MessageContent::Text(CONTINUATION_MESSAGE.into());
                storage = None;
                continue;
            }
            break outcome;
        };

        uow.commit(&self.repo, continuum)?;
        outcome.metadata.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    // ── One turn (no auto-continuation) ────────────────────────────

    async fn run_turn(
        &self,
        continuum: &mut Continuum,
        params: &ProcessParams,
        user_message: MessageContent,
        storage_content: Option<MessageContent>,
        uow: &mut UnitOfWork,
    ) -> Result<(TurnOutcome, bool)> {
        // 1. Append the user message, publish domain events.
        let (user_msg, deltas) = continuum.add_user_message(user_message);
        self.publish_deltas(&deltas);

        // 2. Text for retrieval context.
        let text_for_context = user_msg.content.text_for_context();

        // 3. Evacuation checkpoint.
        let mut previous_memories = self.proactive_memory.cached_memories();
        if let Some(evacuator) = &self.evacuator {
            if evacuator.should_evacuate(&previous_memories) {
                let before = previous_memories.len();
                previous_memories = evacuator.evacuate(&previous_memories, &text_for_context);
                tracing::debug!(
                    before,
                    after = previous_memories.len(),
                    "memory evacuation triggered"
                );
                self.proactive_memory.set_cached_memories(previous_memories.clone());
            }
        }

        // 4. Fingerprint + retention votes. Failures abort the turn.
        let snippets = self.conversation_snippets(continuum);
        let (fingerprint, pinned_ids) = self
            .fingerprint
            .generate(&snippets, &text_for_context, &previous_memories)
            .await?;

        // 5. Retained memories from the previous turn.
        let pinned_memories: Vec<MemoryRecord> = previous_memories
            .iter()
            .filter(|m| pinned_ids.iter().any(|pid| match_memory_id(pid, &m.id)))
            .cloned()
            .collect();

        // 6-8. Fresh retrieval and merge.
        let fingerprint_embedding = self.embeddings.encode_realtime(&fingerprint).await?;
        let fresh = self.relevance.get_relevant_memories(
            &fingerprint,
            &fingerprint_embedding,
            &[],
            self.cfg.memory.retrieval_limit,
        );
        let fresh_count = fresh.len();
        let surfaced = merge_memories(pinned_memories.clone(), fresh);

        // 9. Retrieval log for offline evaluation.
        tracing::info!(
            continuum_id = %continuum.id,
            raw_query = %text_for_context,
            fingerprint = %fingerprint,
            pinned = pinned_memories.len(),
            fresh = fresh_count,
            surfaced = surfaced.len(),
            "memory surfacing"
        );

        // 10. Hand the merged list to the proactive-memory trinket.
        self.bus.publish(&ContinuumEvent::UpdateTrinket {
            continuum_id: continuum.id,
            target_trinket: "ProactiveMemoryTrinket".into(),
            context: TrinketContext {
                user: params.user.clone(),
                memories: Some(surfaced.clone()),
                ..Default::default()
            },
        });

        // 11. Compose the three-zone prompt.
        let composed =
            self.working_memory
                .compose_now(continuum.id, &params.system_prompt, &params.user);

        // 12. Build the message array:
        //     SYSTEM → HISTORY → NOTIFICATION CENTER → CURRENT USER.
        let mut system_blocks = Vec::new();
        if !composed.cached_content.is_empty() {
            system_blocks.push(ContentBlock::cached_text(composed.cached_content.clone()));
        }
        if !composed.non_cached_content.is_empty() {
            system_blocks.push(ContentBlock::text(composed.non_cached_content.clone()));
        }

        let mut api_messages = continuum.messages_for_api();
        let current_user = api_messages.pop().ok_or_else(|| {
            Error::Infrastructure("continuum lost the current user message".into())
        })?;

        let mut complete_messages =
            vec![ApiMessage::system(MessageContent::Blocks(system_blocks))];
        complete_messages.extend(api_messages);
        if !composed.notification_center.is_empty() {
            complete_messages.push(ApiMessage::assistant(format!(
                "{HUD_DELIMITER}\n{}",
                composed.notification_center
            )));
        }
        complete_messages.push(current_user);

        // 13. One-shot trim from a previous async judgment.
        let mut messages_for_llm = complete_messages.clone();
        if let Some(trim) = self.pending_context_trim.lock().remove(&continuum.id) {
            if trim + 1 < messages_for_llm.len() {
                tracing::info!(trim, "applying one-shot trim from async judgment");
                let mut trimmed = vec![messages_for_llm[0].clone()];
                trimmed.extend_from_slice(&messages_for_llm[trim + 1..]);
                messages_for_llm = trimmed;
            }
        }

        // 14. Overflow loop around the provider call.
        let tools = self.tool_registry.definitions();
        let container_id = self.container_for_request(continuum, &tools);
        let (response, observations) = self
            .generate_with_remediation(
                continuum,
                params,
                &complete_messages,
                messages_for_llm,
                &tools,
                container_id,
                &text_for_context,
            )
            .await?;

        // 15. Bookkeeping from the response.
        if response.usage.input_tokens > 0 {
            self.last_turn_usage
                .lock()
                .insert(continuum.id, response.usage.input_tokens);
        }
        if let Some(container) = &response.container_id {
            self.kv
                .setex(&format!("{KEY_CONTAINER}{}", continuum.id), 3600, container);
            tracing::debug!(%container, "stored container id");
        }

        // Parse tags; emotion is preserved in the visible text.
        let parsed = parse_response(&response.text());
        let mut clean_text = parsed.clean_text;
        let mut model_error = false;

        if clean_text.trim().is_empty() {
            if let Some(reason) = &observations.breaker_tool_error {
                tracing::warn!(reason = %reason, "model returned blank after tool error");
                clean_text = MODEL_ERROR_APOLOGY.into();
                model_error = true;
            }
        }
        if clean_text.trim().is_empty() {
            return Err(Error::Validation(
                "Assistant response cannot be blank or empty. This may indicate an API error."
                    .into(),
            ));
        }

        // Resolve short memory references against this turn's surfaced set.
        let referenced: Vec<Uuid> = parsed
            .referenced_memories
            .iter()
            .filter_map(|short| {
                surfaced
                    .iter()
                    .find(|m| match_memory_id(short, &m.id))
                    .map(|m| m.id)
            })
            .collect();
        let surfaced_ids: Vec<Uuid> = surfaced.iter().map(|m| m.id).collect();
        let pinned_id_list: Vec<String> = pinned_ids.iter().cloned().collect();

        // 16. Append the assistant message and publish completion.
        let assistant_metadata = MessageMetadata {
            referenced_memories: referenced.clone(),
            surfaced_memories: surfaced_ids.clone(),
            pinned_memory_ids: pinned_id_list.clone(),
            emotion: parsed.emotion.clone(),
            model_error,
            model_error_reason: observations.breaker_tool_error.clone().filter(|_| model_error),
            ..Default::default()
        };
        let (assistant_msg, deltas) =
            continuum.add_assistant_message(clean_text.clone(), assistant_metadata);
        self.publish_deltas(&deltas);

        self.bus.publish(&ContinuumEvent::TurnCompleted {
            continuum_id: continuum.id,
            turn_number: continuum.turn_number(),
            segment_turn_number: params.segment_turn_number,
        });

        // 17. Stage persistence (commit happens once, at the very end).
        if user_msg.content.has_image() && storage_content.is_none() {
            return Err(Error::Validation(
                "storage_content is required when user_message contains images. Callers must \
                 provide the 512px WebP storage tier for image persistence."
                    .into(),
            ));
        }
        let mut persist_user = user_msg.clone();
        if let Some(storage) = storage_content {
            persist_user.content = storage;
        }
        uow.add_messages(persist_user, assistant_msg);
        uow.mark_metadata_updated();
        self.repo.update_cache(continuum);

        let metadata = TurnMetadata {
            tools_used: observations.tools_used,
            referenced_memories: referenced,
            surfaced_memories: surfaced_ids,
            pinned_memory_ids: pinned_id_list,
            emotion: parsed.emotion,
            model_error,
            processing_time_ms: 0,
        };
        Ok((
            TurnOutcome { response: clean_text, metadata },
            observations.invoked_tool_loader,
        ))
    }

    // ── Overflow loop ──────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn generate_with_remediation(
        &self,
        continuum: &Continuum,
        params: &ProcessParams,
        complete_messages: &[ApiMessage],
        mut messages_for_llm: Vec<ApiMessage>,
        tools: &[serde_json::Value],
        container_id: Option<String>,
        text_for_context: &str,
    ) -> Result<(ProviderMessage, StreamObservations)> {
        let max_retries = self.cfg.context.max_overflow_retries;
        let available = self
            .cfg
            .api
            .context_window_tokens
            .saturating_sub(self.cfg.api.max_tokens as u64);
        let mut attempt = 0usize;

        loop {
            // Proactive estimate before spending a request.
            let last_input = self.last_turn_usage.lock().get(&continuum.id).copied();
            let estimated = estimate_request_tokens(&messages_for_llm, tools, last_input);
            if estimated > available {
                attempt += 1;
                tracing::warn!(
                    estimated,
                    available,
                    attempt,
                    "proactive context overflow detected"
                );
                if attempt > max_retries {
                    return Err(Error::ContextOverflow {
                        estimated_tokens: estimated,
                        context_window: self.cfg.api.context_window_tokens,
                        provider: "preflight",
                    });
                }
                messages_for_llm = self
                    .apply_remediation(
                        attempt,
                        messages_for_llm,
                        complete_messages,
                        continuum,
                        text_for_context,
                        estimated,
                        "proactive",
                    )
                    .await?;
                continue;
            }

            let (inner_tx, inner_rx) = mpsc::channel::<StreamEvent>(256);
            let collector = spawn_collector(inner_rx, params.events.clone());

            let req = GenerateRequest {
                messages: messages_for_llm.clone(),
                tools: tools.to_vec(),
                container_id: container_id.clone(),
                user: params.user.clone(),
                ..Default::default()
            };

            let result = self.llm.generate_response(req, Some(inner_tx)).await;
            let observations = collector.await.map_err(|e| {
                Error::Infrastructure(format!("event collector task failed: {e}"))
            })?;

            match result {
                Ok(response) => return Ok((response, observations)),
                Err(Error::ContextOverflow { estimated_tokens, .. }) => {
                    attempt += 1;
                    tracing::warn!(attempt, "context overflow from API");
                    if attempt > max_retries {
                        return Err(Error::ContextOverflow {
                            estimated_tokens,
                            context_window: self.cfg.api.context_window_tokens,
                            provider: "exhausted",
                        });
                    }
                    messages_for_llm = self
                        .apply_remediation(
                            attempt,
                            messages_for_llm,
                            complete_messages,
                            continuum,
                            text_for_context,
                            estimated_tokens,
                            "reactive",
                        )
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Tiered remediation. Tier 1 (evacuation) only runs when an evacuator
    /// is attached and enough memories are pinned to matter; otherwise the
    /// first attempt goes straight to drift pruning.
    #[allow(clippy::too_many_arguments)]
    async fn apply_remediation(
        &self,
        attempt: usize,
        messages_for_llm: Vec<ApiMessage>,
        complete_messages: &[ApiMessage],
        continuum: &Continuum,
        text_for_context: &str,
        estimated_tokens: u64,
        event_type: &'static str,
    ) -> Result<Vec<ApiMessage>> {
        let messages_before = messages_for_llm.len();

        if attempt == 1 {
            if let Some(evacuator) = &self.evacuator {
                let previous = self.proactive_memory.cached_memories();
                if previous.len() > 3 {
                    let evacuated = evacuator.evacuate(&previous, text_for_context);
                    tracing::warn!(
                        remediation_tier = 1,
                        event_type,
                        estimated_tokens,
                        messages_before,
                        messages_after = messages_before,
                        before = previous.len(),
                        after = evacuated.len(),
                        "overflow remediation: forced memory evacuation"
                    );
                    self.proactive_memory.set_cached_memories(evacuated);
                    // Messages unchanged; the next compose rebuilds a
                    // smaller system prompt.
                    return Ok(messages_for_llm);
                }
            }
        }

        if attempt <= 2 {
            let (pruned, analysis) = prune_by_topic_drift(
                self.embeddings.as_ref(),
                &messages_for_llm,
                &self.cfg.context,
            )
            .await?;
            tracing::warn!(
                remediation_tier = 2,
                event_type,
                estimated_tokens,
                messages_before,
                messages_after = pruned.len(),
                selection_method = analysis.selection_method,
                candidates = analysis.candidate_cuts.len(),
                "overflow remediation: topic drift pruning"
            );
            overflow::schedule_async_judgment(
                Arc::clone(&self.llm),
                self.cfg.api.utility_model.clone(),
                continuum.id,
                complete_messages.to_vec(),
                analysis.candidate_cuts,
                Arc::clone(&self.pending_context_trim),
            );
            // The baseline came from the un-pruned conversation.
            self.last_turn_usage.lock().remove(&continuum.id);
            return Ok(pruned);
        }

        let pruned = prune_oldest_first(&messages_for_llm, &self.cfg.context);
        tracing::warn!(
            remediation_tier = 3,
            event_type,
            estimated_tokens,
            messages_before,
            messages_after = pruned.len(),
            "overflow remediation: oldest-first fallback"
        );
        self.last_turn_usage.lock().remove(&continuum.id);
        Ok(pruned)
    }

    // ── Small helpers ──────────────────────────────────────────────

    fn publish_deltas(&self, deltas: &[ContinuumDelta]) {
        for delta in deltas {
            let event = match delta {
                ContinuumDelta::UserMessageAdded { continuum_id, message_id } => {
                    ContinuumEvent::MessageAdded {
                        continuum_id: *continuum_id,
                        message_id: *message_id,
                        role: "user",
                    }
                }
                ContinuumDelta::AssistantMessageAdded { continuum_id, message_id } => {
                    ContinuumEvent::MessageAdded {
                        continuum_id: *continuum_id,
                        message_id: *message_id,
                        role: "assistant",
                    }
                }
            };
            self.bus.publish(&event);
        }
    }

    /// Recent conversation (excluding the just-added user message) for the
    /// fingerprint prompt.
    fn conversation_snippets(&self, continuum: &Continuum) -> Vec<ConversationSnippet> {
        let mut api = continuum.messages_for_api();
        api.pop();
        api.into_iter()
            .map(|m| ConversationSnippet {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                },
                text: m.content.text_for_context(),
            })
            .collect()
    }

    /// Container reuse: only passed through when code_execution is in the
    /// tool list and a cached id exists for this continuum.
    fn container_for_request(
        &self,
        continuum: &Continuum,
        tools: &[serde_json::Value],
    ) -> Option<String> {
        let has_code_execution = tools.iter().any(is_server_side_tool);
        if !has_code_execution {
            return None;
        }
        let cached = self.kv.get(&format!("{KEY_CONTAINER}{}", continuum.id));
        match &cached {
            Some(id) => tracing::debug!(container = %id, "reusing container from cache"),
            None => tracing::debug!("no cached container - a new one will be created"),
        }
        cached
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream event collector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Watch the provider's event stream: forward everything to the caller,
/// record tool usage, tool-loader invocations (for auto-continuation), and
/// breaker-terminated tool errors (for the blank-response apology).
fn spawn_collector(
    mut rx: mpsc::Receiver<StreamEvent>,
    forward: Option<mpsc::Sender<StreamEvent>>,
) -> tokio::task::JoinHandle<StreamObservations> {
    tokio::spawn(async move {
        let mut observations = StreamObservations {
            tools_used: Vec::new(),
            invoked_tool_loader: false,
            breaker_tool_error: None,
        };
        while let Some(event) = rx.recv().await {
            match &event {
                StreamEvent::ToolExecuting { tool_name, arguments, .. } => {
                    if tool_name == CODE_EXECUTION_TOOL_NAME {
                        let code = arguments
                            .get("code")
                            .and_then(|c| c.as_str())
                            .unwrap_or_default();
                        tracing::info!(%code, "code_execution invoked");
                    } else if tool_name == TOOL_LOADER_NAME {
                        let mode = arguments
                            .get("mode")
                            .and_then(|m| m.as_str())
                            .unwrap_or_default();
                        if matches!(mode, "load" | "fallback" | "prepare_code_execution") {
                            observations.invoked_tool_loader = true;
                            tracing::info!(mode, "detected tool loader execution");
                        }
                    } else {
                        tracing::info!(tool = %tool_name, args = %arguments, "tool executing");
                    }
                    if !observations.tools_used.contains(tool_name) {
                        observations.tools_used.push(tool_name.clone());
                    }
                }
                StreamEvent::ToolCompleted { tool_name, result, .. } => {
                    let preview: String = result.chars().take(200).collect();
                    tracing::info!(tool = %tool_name, %preview, "tool completed");
                }
                StreamEvent::ToolError { tool_name, error, .. } => {
                    tracing::error!(tool = %tool_name, %error, "tool error");
                }
                StreamEvent::CircuitBreaker { reason } => {
                    if reason.contains("failed after correction") {
                        observations.breaker_tool_error = Some(reason.clone());
                    }
                }
                _ => {}
            }
            if let Some(tx) = &forward {
                // A slow or dropped consumer never stalls bookkeeping.
                let _ = tx.send(event).await;
            }
        }
        observations
    })
}
