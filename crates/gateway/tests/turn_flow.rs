//! Orchestrator turn flow against a scripted provider.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use mira_continuum::{Continuum, ContinuumRepository};
use mira_domain::config::Config;
use mira_domain::message::{
    ApiMessage, BlockSource, ContentBlock, MessageContent, ProviderMessage, Role, StopReason,
    Usage, UserContext,
};
use mira_domain::stream::StreamEvent;
use mira_domain::tags::format_memory_id;
use mira_domain::{Error, Result};
use mira_gateway::orchestrator::{Orchestrator, ProcessParams};
use mira_kv::KvStore;
use mira_memory::{
    Embeddings, FingerprintGenerator, InMemoryStore, MemoryRecord, MemoryRelevanceService,
    MemoryStore, StoredMemory,
};
use mira_providers::{GenerateRequest, LlmClient};
use mira_tools::ToolRegistry;
use mira_working_memory::{
    EventBus, ProactiveMemoryTrinket, TimeManager, Trinket, WorkingMemory,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test doubles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StubEmbeddings;

#[async_trait]
impl Embeddings for StubEmbeddings {
    async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vector_for(text))
    }
    async fn encode_deep(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vector_for(text))
    }
}

fn vector_for(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 768];
    for (i, b) in text.bytes().enumerate() {
        v[(b as usize * 31 + i) % 768] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter().map(|x| x / norm).collect()
}

/// One scripted main-model reply: events streamed, then the final message.
struct ScriptedReply {
    events: Vec<StreamEvent>,
    response: ProviderMessage,
}

struct MockLlm {
    utility_model: String,
    fingerprint_reply: Mutex<String>,
    fingerprint_fails: Mutex<bool>,
    main_replies: Mutex<VecDeque<ScriptedReply>>,
    main_requests: Mutex<Vec<GenerateRequest>>,
}

impl MockLlm {
    fn new(utility_model: &str) -> Self {
        Self {
            utility_model: utility_model.into(),
            fingerprint_reply: Mutex::new("retrieval query".into()),
            fingerprint_fails: Mutex::new(false),
            main_replies: Mutex::new(VecDeque::new()),
            main_requests: Mutex::new(Vec::new()),
        }
    }

    fn push_text_reply(&self, text: &str) {
        self.push_reply(ScriptedReply { events: vec![], response: text_message(text) });
    }

    fn push_reply(&self, reply: ScriptedReply) {
        self.main_replies.lock().push_back(reply);
    }
}

fn text_message(text: &str) -> ProviderMessage {
    ProviderMessage {
        content: vec![ContentBlock::text(text)],
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage { input_tokens: 500, output_tokens: 20, ..Default::default() },
        container_id: None,
        reasoning_details: None,
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate_response(
        &self,
        req: GenerateRequest,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<ProviderMessage> {
        if req.model_override.as_deref() == Some(self.utility_model.as_str()) {
            if *self.fingerprint_fails.lock() {
                return Err(Error::Upstream {
                    service: "anthropic".into(),
                    message: "utility model unavailable".into(),
                });
            }
            return Ok(text_message(&self.fingerprint_reply.lock().clone()));
        }

        self.main_requests.lock().push(req);
        let reply = self
            .main_replies
            .lock()
            .pop_front()
            .expect("no scripted reply left for main model call");
        if let Some(tx) = &events {
            for event in &reply.events {
                let _ = tx.send(event.clone()).await;
            }
        }
        Ok(reply.response)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    orchestrator: Orchestrator,
    repo: Arc<ContinuumRepository>,
    proactive: Arc<ProactiveMemoryTrinket>,
    store: Arc<InMemoryStore>,
    llm: Arc<MockLlm>,
    user: UserContext,
    _tmp: tempfile::TempDir,
}

fn build_harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.state.path = tmp.path().to_path_buf();

    let llm = Arc::new(MockLlm::new(&cfg.api.utility_model));
    let bus = Arc::new(EventBus::new());
    let kv = Arc::new(KvStore::new());
    let repo = Arc::new(ContinuumRepository::new(cfg.state.path.clone()).unwrap());
    let tool_registry = ToolRegistry::with_loader();
    let embeddings: Arc<dyn Embeddings> = Arc::new(StubEmbeddings);
    let store = Arc::new(InMemoryStore::new());
    let relevance = Arc::new(MemoryRelevanceService::new(
        Arc::clone(&store) as Arc<dyn MemoryStore>,
        cfg.memory.vector_weight,
        cfg.memory.text_weight,
        cfg.memory.max_link_traversal_depth,
    ));
    let fingerprint = Arc::new(FingerprintGenerator::new(
        Arc::clone(&llm) as Arc<dyn LlmClient>,
        cfg.api.utility_model.clone(),
    ));

    let working_memory = WorkingMemory::new(Arc::clone(&bus), Arc::clone(&kv));
    let proactive = Arc::new(ProactiveMemoryTrinket::new());
    working_memory.register_trinket(Arc::new(TimeManager));
    working_memory.register_trinket(Arc::clone(&proactive) as Arc<dyn Trinket>);

    let orchestrator = Orchestrator::new(
        cfg,
        Arc::clone(&llm) as Arc<dyn LlmClient>,
        Arc::clone(&repo),
        bus,
        working_memory,
        Arc::clone(&proactive),
        tool_registry,
        fingerprint,
        relevance,
        embeddings,
        kv,
        None,
    );

    Harness {
        orchestrator,
        repo,
        proactive,
        store,
        llm,
        user: UserContext::default(),
        _tmp: tmp,
    }
}

fn params(h: &Harness, text: &str) -> ProcessParams {
    ProcessParams {
        user: h.user.clone(),
        user_message: MessageContent::Text(text.into()),
        storage_content: None,
        system_prompt: "You are MIRA, helping The User.".into(),
        segment_turn_number: 1,
        events: None,
    }
}

fn memory(id: Uuid, text: &str) -> MemoryRecord {
    MemoryRecord {
        id,
        text: text.into(),
        importance_score: 0.5,
        confidence: Some(0.8),
        created_at: chrono::Utc::now(),
        happens_at: None,
        expires_at: None,
        access_count: 0,
        is_refined: false,
        linked_memories: vec![],
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn plain_text_turn() {
    let h = build_harness();
    h.llm.push_text_reply("Hello there!");

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "Say hello"))
        .await
        .unwrap();

    assert_eq!(outcome.response, "Hello there!");
    assert!(outcome.metadata.tools_used.is_empty());
    assert_eq!(continuum.messages.len(), 2);
    assert_eq!(continuum.messages[0].role, Role::User);
    assert_eq!(continuum.messages[1].role, Role::Assistant);

    // Turn persisted durably on commit.
    let persisted = h.repo.load_persisted(h.user.user_id).unwrap().unwrap();
    assert_eq!(persisted.messages.len(), 2);
}

#[tokio::test]
async fn request_carries_system_blocks_and_hud() {
    let h = build_harness();
    h.llm.push_text_reply("ok");

    let mut continuum = Continuum::new(h.user.user_id);
    h.orchestrator
        .process_message(&mut continuum, params(&h, "check the prompt shape"))
        .await
        .unwrap();

    let requests = h.llm.main_requests.lock();
    let req = &requests[0];

    // First message: system with a cached block first.
    let system = &req.messages[0];
    assert_eq!(system.role, Role::System);
    match &system.content {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::Text { cache_control, text } => {
                assert!(cache_control.is_some());
                assert!(text.contains("You are MIRA"));
            }
            other => panic!("expected text block, got {other:?}"),
        },
        other => panic!("expected system blocks, got {other:?}"),
    }

    // Second-to-last: the HUD assistant message (time trinket registered).
    let hud = &req.messages[req.messages.len() - 2];
    assert_eq!(hud.role, Role::Assistant);
    assert!(hud.content.extract_all_text().contains("HUD"));
    assert!(hud.content.extract_all_text().contains("<current_datetime>"));

    // Last: the current user message.
    let last = req.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content.extract_all_text(), "check the prompt shape");
}

#[tokio::test]
async fn tool_events_populate_metadata() {
    let h = build_harness();
    h.llm.push_reply(ScriptedReply {
        events: vec![
            StreamEvent::ToolDetected {
                tool_name: "answer_tool".into(),
                tool_id: "tu_1".into(),
            },
            StreamEvent::ToolExecuting {
                tool_name: "answer_tool".into(),
                tool_id: "tu_1".into(),
                arguments: serde_json::json!({"q": "x"}),
            },
            StreamEvent::ToolCompleted {
                tool_name: "answer_tool".into(),
                tool_id: "tu_1".into(),
                result: "{\"result\":\"42\"}".into(),
            },
        ],
        response: text_message("The answer is 42."),
    });

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "what is the answer?"))
        .await
        .unwrap();

    assert_eq!(outcome.metadata.tools_used, vec!["answer_tool"]);
    assert_eq!(outcome.response, "The answer is 42.");
}

#[tokio::test]
async fn memory_retention_round_trip() {
    let h = build_harness();

    // Previous turn surfaced five memories.
    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    let previous: Vec<MemoryRecord> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| memory(*id, &format!("fact number {i}")))
        .collect();
    h.proactive.set_cached_memories(previous);

    // The model votes to retain A (index 0) and C (index 2).
    *h.llm.fingerprint_reply.lock() = format!(
        "query about facts\n[x] {}\n[x] {}",
        format_memory_id(&ids[0]),
        format_memory_id(&ids[2]),
    );

    // Fresh retrieval returns A again plus a new memory.
    h.store.add(StoredMemory {
        record: memory(ids[0], "fact number 0"),
        embedding: vector_for("fact number 0"),
        entities: vec![],
    });
    let fresh_id = Uuid::new_v4();
    h.store.add(StoredMemory {
        record: memory(fresh_id, "a brand new fact"),
        embedding: vector_for("a brand new fact"),
        entities: vec![],
    });

    h.llm.push_text_reply("noted");
    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "tell me about the facts"))
        .await
        .unwrap();

    // Merged list: pinned first (A, C), then fresh with A deduplicated.
    let surfaced = outcome.metadata.surfaced_memories.clone();
    assert_eq!(surfaced[0], ids[0]);
    assert_eq!(surfaced[1], ids[2]);
    assert_eq!(surfaced.iter().filter(|id| **id == ids[0]).count(), 1);
    assert!(surfaced.contains(&fresh_id));

    // Votes recorded as pinned short IDs.
    assert_eq!(outcome.metadata.pinned_memory_ids.len(), 2);

    // The trinket cache now holds the merged list for the next turn.
    let cached = h.proactive.cached_memories();
    assert_eq!(cached[0].id, ids[0]);
    assert_eq!(cached[1].id, ids[2]);
}

#[tokio::test]
async fn referenced_memories_resolved_from_short_ids() {
    let h = build_harness();
    let id = Uuid::new_v4();
    h.proactive.set_cached_memories(vec![memory(id, "espresso preference")]);
    *h.llm.fingerprint_reply.lock() = format!("coffee\n[x] {}", format_memory_id(&id));

    h.llm
        .push_text_reply(&format!("You like espresso ({}).", format_memory_id(&id)));

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "what coffee do I like?"))
        .await
        .unwrap();

    assert_eq!(outcome.metadata.referenced_memories, vec![id]);
    let assistant = &continuum.messages[1];
    assert_eq!(assistant.metadata.referenced_memories, vec![id]);
}

#[tokio::test]
async fn emotion_tag_extracted_and_preserved() {
    let h = build_harness();
    h.llm
        .push_text_reply("Great news! <mira:my_emotion>excited</mira:my_emotion>");

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "I got the job!"))
        .await
        .unwrap();

    assert_eq!(outcome.metadata.emotion.as_deref(), Some("excited"));
    assert!(outcome.response.contains("<mira:my_emotion>excited</mira:my_emotion>"));
}

#[tokio::test]
async fn blank_response_after_breaker_becomes_apology() {
    let h = build_harness();
    h.llm.push_reply(ScriptedReply {
        events: vec![StreamEvent::CircuitBreaker {
            reason: "Tool 'web_tool' failed after correction attempt: boom".into(),
        }],
        response: ProviderMessage {
            content: vec![],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
            container_id: None,
            reasoning_details: None,
        },
    });

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "fetch that page"))
        .await
        .unwrap();

    assert!(outcome.metadata.model_error);
    assert!(outcome.response.contains("limitation of the model"));
    assert!(continuum.messages[1].metadata.model_error);
}

#[tokio::test]
async fn blank_response_without_breaker_is_an_error() {
    let h = build_harness();
    h.llm.push_reply(ScriptedReply {
        events: vec![],
        response: ProviderMessage {
            content: vec![ContentBlock::text("   ")],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
            container_id: None,
            reasoning_details: None,
        },
    });

    let mut continuum = Continuum::new(h.user.user_id);
    let err = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn fingerprint_failure_aborts_without_partial_write() {
    let h = build_harness();
    *h.llm.fingerprint_fails.lock() = true;
    h.llm.push_text_reply("never reached");

    let mut continuum = Continuum::new(h.user.user_id);
    let err = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream { .. }));

    // In-memory continuum has the user message but nothing durable.
    assert_eq!(continuum.messages.len(), 1);
    assert!(h.repo.load_persisted(h.user.user_id).unwrap().is_none());
}

#[tokio::test]
async fn image_without_storage_tier_rejected() {
    let h = build_harness();
    h.llm.push_text_reply("nice photo");

    let mut continuum = Continuum::new(h.user.user_id);
    let mut p = params(&h, "");
    p.user_message = MessageContent::Blocks(vec![
        ContentBlock::Image { source: BlockSource::base64("image/jpeg", "AAAA") },
        ContentBlock::text("what is this?"),
    ]);
    p.storage_content = None;

    let err = h
        .orchestrator
        .process_message(&mut continuum, p)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn auto_continues_once_after_tool_loader() {
    let h = build_harness();
    // First turn: the model loads a tool.
    h.llm.push_reply(ScriptedReply {
        events: vec![StreamEvent::ToolExecuting {
            tool_name: "invokeother_tool".into(),
            tool_id: "tu_1".into(),
            arguments: serde_json::json!({"mode": "load", "query": "calendar"}),
        }],
        response: text_message("Loading the calendar tool."),
    });
    // Continuation turn: the task completes.
    h.llm.push_reply(ScriptedReply {
        events: vec![StreamEvent::ToolExecuting {
            tool_name: "invokeother_tool".into(),
            tool_id: "tu_2".into(),
            arguments: serde_json::json!({"mode": "load", "query": "calendar"}),
        }],
        response: text_message("Your next meeting is at 3pm."),
    });

    let mut continuum = Continuum::new(h.user.user_id);
    let outcome = h
        .orchestrator
        .process_message(&mut continuum, params(&h, "what's on my calendar?"))
        .await
        .unwrap();

    // Continued exactly once even though the loader fired again.
    assert_eq!(outcome.response, "Your next meeting is at 3pm.");
    assert_eq!(continuum.messages.len(), 4);
    let continuation = continuum.messages[2].content.extract_all_text();
    assert!(continuation.contains("the tool is now available"));

    // Both turns became durable in one commit.
    let persisted = h.repo.load_persisted(h.user.user_id).unwrap().unwrap();
    assert_eq!(persisted.messages.len(), 4);
}

#[tokio::test]
async fn events_forwarded_to_caller() {
    let h = build_harness();
    h.llm.push_reply(ScriptedReply {
        events: vec![StreamEvent::Text { content: "partial".into() }],
        response: text_message("partial output done"),
    });

    let (tx, mut rx) = mpsc::channel(64);
    let mut continuum = Continuum::new(h.user.user_id);
    let mut p = params(&h, "stream this");
    p.events = Some(tx);
    h.orchestrator.process_message(&mut continuum, p).await.unwrap();

    let mut saw_text = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, StreamEvent::Text { .. }) {
            saw_text = true;
        }
    }
    assert!(saw_text);
}
