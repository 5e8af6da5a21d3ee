//! The LLM provider facade.
//!
//! Single public surface for all LLM calls: routes between the native
//! adapter and the generic OpenAI-compatible adapter, consults the
//! process-wide failover flag before every request, runs the tool loop with
//! parallel execution and circuit-breaker guarding, and maps provider
//! errors into the shared error kinds.

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

use mira_domain::config::ApiConfig;
use mira_domain::message::{
    ApiMessage, ContentBlock, MessageContent, ProviderMessage, Role, UserContext,
};
use mira_domain::stream::{BoxStream, StreamEvent};
use mira_domain::tool::{ToolCall, CODE_EXECUTION_TOOL_NAME};
use mira_domain::{Error, Result};
use mira_tools::ToolRegistry;

use crate::circuit_breaker::CircuitBreaker;
use crate::firehose::Firehose;
use crate::{anthropic, openai_compat};

/// Backstop on tool-loop iterations; the circuit breaker is the real guard.
const MAX_TOOL_LOOPS: usize = 25;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One generate request. Defaults route to the native provider with the
/// configured model.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub messages: Vec<ApiMessage>,
    /// Raw tool definitions (registry schemas plus any server-side entries).
    pub tools: Vec<Value>,
    /// Custom OpenAI-compatible endpoint. Requires `model_override`.
    pub endpoint_url: Option<String>,
    pub model_override: Option<String>,
    pub api_key_override: Option<String>,
    pub system_override: Option<String>,
    pub thinking_enabled: Option<bool>,
    pub thinking_budget: Option<u32>,
    pub container_id: Option<String>,
    pub temperature: Option<f32>,
    pub user: UserContext,
}

/// Fully resolved parameters for one adapter call.
#[derive(Debug, Clone)]
pub(crate) struct CallSpec {
    pub messages: Vec<ApiMessage>,
    pub tools: Vec<Value>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking_enabled: bool,
    pub thinking_budget: u32,
    pub container_id: Option<String>,
    pub enable_prompt_caching: bool,
    #[allow(dead_code)]
    pub user: UserContext,
}

#[derive(Debug, Clone)]
enum Route {
    Native { api_key: String },
    Generic {
        endpoint: String,
        model: String,
        api_key: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process-wide failover state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FailoverState {
    active: bool,
    /// Bumped on every activation so stale recovery timers are ignored.
    generation: u64,
}

fn failover_state() -> &'static Mutex<FailoverState> {
    static STATE: OnceLock<Mutex<FailoverState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(FailoverState { active: false, generation: 0 }))
}

fn is_failover_active() -> bool {
    failover_state().lock().active
}

/// Activate emergency failover for all users and schedule a recovery test.
fn activate_failover(recovery_minutes: u64) {
    let generation = {
        let mut state = failover_state().lock();
        state.active = true;
        state.generation += 1;
        state.generation
    };
    tracing::warn!(
        recovery_minutes,
        "EMERGENCY FAILOVER ACTIVATED - all traffic routing to fallback provider"
    );
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(recovery_minutes * 60)).await;
        let mut state = failover_state().lock();
        if state.generation == generation {
            state.active = false;
            tracing::warn!("failover recovery test - next request will try the primary provider");
        }
    });
}

#[cfg(test)]
pub(crate) fn reset_failover_for_tests() {
    let mut state = failover_state().lock();
    state.active = false;
    state.generation += 1;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Object-safe generate surface; the orchestrator and tests depend on this
/// rather than the concrete provider.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_response(
        &self,
        req: GenerateRequest,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<ProviderMessage>;
}

enum Backend {
    Http(reqwest::Client),
    /// Canned per-call streams for tool-loop tests.
    #[cfg(test)]
    Scripted(Mutex<std::collections::VecDeque<Vec<Result<StreamEvent>>>>),
}

pub struct LlmProvider {
    cfg: ApiConfig,
    backend: Backend,
    tool_registry: Option<Arc<ToolRegistry>>,
    firehose: Firehose,
}

impl LlmProvider {
    pub fn new(cfg: ApiConfig, tool_registry: Option<Arc<ToolRegistry>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Infrastructure(format!("http client: {e}")))?;
        tracing::info!(
            model = %cfg.model,
            caching = cfg.enable_prompt_caching,
            fallback = cfg.emergency_fallback_enabled,
            tools = tool_registry.is_some(),
            "LLM provider initialized"
        );
        Ok(Self {
            cfg,
            backend: Backend::Http(client),
            tool_registry,
            firehose: Firehose::from_env(),
        })
    }

    #[cfg(test)]
    pub(crate) fn scripted(
        cfg: ApiConfig,
        tool_registry: Option<Arc<ToolRegistry>>,
        calls: Vec<Vec<Result<StreamEvent>>>,
    ) -> Self {
        Self {
            cfg,
            backend: Backend::Scripted(Mutex::new(calls.into())),
            tool_registry,
            firehose: Firehose::disabled(),
        }
    }

    // ── Routing ────────────────────────────────────────────────────

    fn resolve_route(&self, req: &GenerateRequest) -> Result<Route> {
        if is_failover_active() && self.cfg.emergency_fallback_enabled {
            let endpoint = self.cfg.emergency_fallback_endpoint.clone().ok_or_else(|| {
                Error::Infrastructure("failover active but no emergency endpoint configured".into())
            })?;
            let model = self.cfg.emergency_fallback_model.clone().ok_or_else(|| {
                Error::Infrastructure("failover active but no emergency model configured".into())
            })?;
            return Ok(Route::Generic {
                endpoint,
                model,
                api_key: self.cfg.emergency_fallback_api_key.clone(),
            });
        }

        if let Some(endpoint) = &req.endpoint_url {
            let model = req.model_override.clone().ok_or_else(|| {
                Error::Validation(
                    "When using endpoint_url, model_override must be provided.".into(),
                )
            })?;
            return Ok(Route::Generic {
                endpoint: endpoint.clone(),
                model,
                api_key: req.api_key_override.clone(),
            });
        }

        let api_key = req
            .api_key_override
            .clone()
            .or_else(|| self.cfg.api_key.clone())
            .ok_or_else(|| Error::PermissionDenied("no API key configured".into()))?;
        Ok(Route::Native { api_key })
    }

    fn build_spec(&self, req: &GenerateRequest, route: &Route) -> CallSpec {
        let (model, thinking_enabled) = match route {
            Route::Native { .. } => {
                let model = req
                    .model_override
                    .clone()
                    .unwrap_or_else(|| self.cfg.model.clone());
                let thinking = req.thinking_enabled.unwrap_or(self.cfg.extended_thinking);
                (model, thinking)
            }
            // Fallback and generic providers do not support extended
            // thinking; it is forced off.
            Route::Generic { model, .. } => (model.clone(), false),
        };

        let mut messages = req.messages.clone();
        if let Some(sys) = &req.system_override {
            messages.retain(|m| m.role != Role::System);
            messages.insert(0, ApiMessage::system(sys.clone()));
        }

        CallSpec {
            messages,
            tools: req.tools.clone(),
            model,
            max_tokens: self.cfg.max_tokens,
            temperature: req.temperature.unwrap_or(self.cfg.temperature),
            thinking_enabled,
            thinking_budget: req
                .thinking_budget
                .unwrap_or(self.cfg.extended_thinking_budget),
            container_id: req.container_id.clone(),
            enable_prompt_caching: matches!(route, Route::Native { .. })
                && self.cfg.enable_prompt_caching,
            user: req.user.clone(),
        }
    }

    async fn open_stream(
        &self,
        spec: &CallSpec,
        route: &Route,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        match &self.backend {
            Backend::Http(client) => match route {
                Route::Native { api_key } => {
                    self.firehose.record(
                        "anthropic",
                        &self.cfg.base_url,
                        &spec.model,
                        &anthropic::build_request_body(spec, true),
                    );
                    anthropic::stream_call(client, &self.cfg, api_key, spec).await
                }
                Route::Generic { endpoint, model, api_key, .. } => {
                    self.firehose.record(
                        "generic",
                        endpoint,
                        model,
                        &serde_json::json!({"messages": spec.messages, "tools": spec.tools}),
                    );
                    openai_compat::stream_call(
                        client,
                        endpoint,
                        api_key.as_deref(),
                        model,
                        spec,
                        self.cfg.context_window_tokens,
                    )
                    .await
                }
            },
            #[cfg(test)]
            Backend::Scripted(calls) => {
                let next = calls.lock().pop_front().unwrap_or_default();
                Ok(Box::pin(futures_util::stream::iter(next)))
            }
        }
    }

    /// Run one adapter call to completion, forwarding non-terminal events.
    /// Returns the assembled response from the terminal `Complete`.
    async fn call_once(
        &self,
        spec: &CallSpec,
        route: &Route,
        events: &Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<ProviderMessage> {
        let mut stream = self.open_stream(spec, route).await?;
        let mut response: Option<ProviderMessage> = None;

        while let Some(item) = stream.next().await {
            match item? {
                StreamEvent::Complete { response: r } => {
                    response = Some(r);
                }
                event => emit(events, event).await,
            }
        }

        response.ok_or_else(|| Error::Upstream {
            service: "llm".into(),
            message: "No completion event received from stream".into(),
        })
    }

    /// One adapter call with failover: an upstream failure from the primary
    /// path trips the flag and the call is retried on the emergency route.
    async fn call_with_failover(
        &self,
        req: &GenerateRequest,
        tools_override: Option<&[Value]>,
        events: &Option<mpsc::Sender<StreamEvent>>,
        messages: &[ApiMessage],
    ) -> Result<ProviderMessage> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let route = self.resolve_route(req)?;
            let mut spec = self.build_spec(req, &route);
            spec.messages = messages.to_vec();
            if let Some(tools) = tools_override {
                spec.tools = tools.to_vec();
            }

            match self.call_once(&spec, &route, events).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let primary_failed =
                        matches!(route, Route::Native { .. }) && e.trips_failover();
                    if primary_failed && self.cfg.emergency_fallback_enabled && attempt < 3 {
                        tracing::error!(error = %e, "primary provider error - activating emergency failover");
                        activate_failover(self.cfg.emergency_fallback_recovery_minutes);
                        emit(
                            events,
                            StreamEvent::Retry { attempt, reason: e.to_string() },
                        )
                        .await;
                        continue;
                    }
                    emit(
                        events,
                        StreamEvent::Error {
                            error: e.to_string(),
                            technical_details: Some(format!("{e:?}")),
                        },
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for LlmProvider {
    /// Generate a response, driving the tool loop until the model stops
    /// calling tools or the circuit breaker halts it. Stream events are
    /// pushed to `events` as they occur; the return value is always the
    /// final assembled assistant message.
    async fn generate_response(
        &self,
        req: GenerateRequest,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<ProviderMessage> {
        validate_messages(&req.messages)?;

        let mut messages = req.messages.clone();
        let tools_present = !req.tools.is_empty();
        let registry = self.tool_registry.clone();
        let mut breaker = CircuitBreaker::new();

        for _loop_idx in 0..MAX_TOOL_LOOPS {
            let response = self
                .call_with_failover(&req, None, &events, &messages)
                .await?;

            // Server-side tools run on the provider; only local calls are
            // dispatched here.
            let local_calls: Vec<ToolCall> = response
                .tool_calls()
                .into_iter()
                .filter(|c| c.tool_name != CODE_EXECUTION_TOOL_NAME)
                .collect();

            let Some(registry) = registry.as_ref().filter(|_| tools_present) else {
                let response = preserve_container(response, &req);
                emit(&events, StreamEvent::Complete { response: response.clone() }).await;
                return Ok(response);
            };

            if local_calls.is_empty() {
                let response = preserve_container(response, &req);
                emit(&events, StreamEvent::Complete { response: response.clone() }).await;
                return Ok(response);
            }

            // ── Parallel tool execution ────────────────────────────
            for call in &local_calls {
                emit(
                    &events,
                    StreamEvent::ToolExecuting {
                        tool_name: call.tool_name.clone(),
                        tool_id: call.id.clone(),
                        arguments: call.input.clone(),
                    },
                )
                .await;
            }

            // Results are collected in original order for deterministic
            // event sequencing; latency is max, not sum.
            let futures: Vec<_> = local_calls
                .iter()
                .map(|call| {
                    let registry = Arc::clone(registry);
                    let ctx = req.user.clone();
                    let name = call.tool_name.clone();
                    let input = call.input.clone();
                    async move { registry.invoke_tool(&name, input, &ctx).await }
                })
                .collect();
            let results = futures_util::future::join_all(futures).await;

            let mut tool_results: Vec<ContentBlock> = Vec::with_capacity(local_calls.len());
            for (call, result) in local_calls.iter().zip(results) {
                match result {
                    Ok(value) => {
                        let text = stringify_result(&value);
                        emit(
                            &events,
                            StreamEvent::ToolCompleted {
                                tool_name: call.tool_name.clone(),
                                tool_id: call.id.clone(),
                                result: text.clone(),
                            },
                        )
                        .await;
                        breaker.record_execution(&call.tool_name, Some(&text), None);
                        tool_results.push(ContentBlock::ToolResult {
                            tool_use_id: call.id.clone(),
                            content: text,
                            is_error: false,
                        });
                    }
                    Err(e) => {
                        tracing::error!(tool = %call.tool_name, error = %e, "tool execution failed");
                        let hint = schema_hint(registry, &call.tool_name, &e);
                        let content = format!("Error: {e}{hint}");
                        emit(
                            &events,
                            StreamEvent::ToolError {
                                tool_name: call.tool_name.clone(),
                                tool_id: call.id.clone(),
                                error: e.to_string(),
                            },
                        )
                        .await;
                        breaker.record_execution(&call.tool_name, None, Some(&e.to_string()));
                        tool_results.push(ContentBlock::ToolResult {
                            tool_use_id: call.id.clone(),
                            content,
                            is_error: true,
                        });
                    }
                }
            }

            messages.push(response.to_api_message());

            let (go, reason) = breaker.should_continue();
            if !go {
                tracing::info!(reason = %reason, "circuit breaker triggered");
                emit(&events, StreamEvent::CircuitBreaker { reason: reason.clone() }).await;

                // Append results plus an automated instruction, then force a
                // textual finalization with tools withheld.
                tool_results.push(ContentBlock::text(format!(
                    "[Automated system message: Tool call issue detected - {reason}. No more \
                     tool calls available. Provide your response to the user based on \
                     information gathered so far.]"
                )));
                messages.push(ApiMessage::user(MessageContent::Blocks(tool_results)));

                let final_response = self
                    .call_with_failover(&req, Some(&[]), &events, &messages)
                    .await?;
                let final_response = preserve_container(final_response, &req);
                emit(&events, StreamEvent::Complete { response: final_response.clone() }).await;
                return Ok(final_response);
            }

            if !tool_results.is_empty() {
                messages.push(ApiMessage::user(MessageContent::Blocks(tool_results)));
            }
        }

        let err = Error::Other(format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"));
        emit(
            &events,
            StreamEvent::Error { error: err.to_string(), technical_details: None },
        )
        .await;
        Err(err)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forward an event to the caller's channel. Send failures are logged and
/// never interrupt generation.
async fn emit(events: &Option<mpsc::Sender<StreamEvent>>, event: StreamEvent) {
    if let Some(tx) = events {
        if let Err(e) = tx.send(event).await {
            tracing::error!(error = %e, "stream event consumer dropped");
        }
    }
}

/// Keep the request's container id on the final message even when the
/// provider does not echo one.
fn preserve_container(mut response: ProviderMessage, req: &GenerateRequest) -> ProviderMessage {
    if response.container_id.is_none() {
        response.container_id = req.container_id.clone();
    }
    response
}

fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// For parameter-shaped errors, append the tool's input schema so the model
/// can self-correct on its retry.
fn schema_hint(registry: &ToolRegistry, tool_name: &str, error: &Error) -> String {
    let text = error.to_string().to_lowercase();
    let param_shaped = matches!(error, Error::Validation(_))
        || ["unknown operation", "invalid", "required", "missing", "parameter"]
            .iter()
            .any(|kw| text.contains(kw));
    if !param_shaped {
        return String::new();
    }
    let Some(def) = registry.get_tool_definition(tool_name) else {
        return String::new();
    };
    let props = def
        .input_schema
        .get("properties")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    match serde_json::to_string_pretty(&props) {
        Ok(pretty) => format!("\n\nCORRECT PARAMETERS:\n{pretty}"),
        Err(_) => String::new(),
    }
}

/// Validate messages before sending to any provider.
fn validate_messages(messages: &[ApiMessage]) -> Result<()> {
    if messages.is_empty() {
        return Err(Error::Validation("Cannot send empty messages list to LLM API".into()));
    }
    for (idx, msg) in messages.iter().enumerate() {
        match &msg.content {
            MessageContent::Text(t) => {
                if t.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "Cannot send empty {} message to LLM API",
                        msg.role.as_str()
                    )));
                }
            }
            MessageContent::Blocks(blocks) => {
                if blocks.is_empty() {
                    return Err(Error::Validation(format!(
                        "Cannot send empty {} message to LLM API",
                        msg.role.as_str()
                    )));
                }
                for block in blocks {
                    if let ContentBlock::ContainerUpload { file_id } = block {
                        if file_id.is_empty() {
                            return Err(Error::Validation(format!(
                                "container_upload block in message {idx} is missing required \
                                 file_id field"
                            )));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mira_domain::message::{StopReason, Usage};
    use mira_domain::tool::ToolDefinition;
    use mira_tools::Tool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_cfg() -> ApiConfig {
        ApiConfig { api_key: Some("test-key".into()), ..Default::default() }
    }

    fn text_response(text: &str) -> ProviderMessage {
        ProviderMessage {
            content: vec![ContentBlock::text(text)],
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage::default(),
            container_id: None,
            reasoning_details: None,
        }
    }

    fn tool_response(id: &str, name: &str, input: Value) -> ProviderMessage {
        ProviderMessage {
            content: vec![ContentBlock::ToolUse { id: id.into(), name: name.into(), input }],
            stop_reason: Some(StopReason::ToolUse),
            usage: Usage::default(),
            container_id: None,
            reasoning_details: None,
        }
    }

    fn complete(msg: ProviderMessage) -> Vec<Result<StreamEvent>> {
        vec![Ok(StreamEvent::Complete { response: msg })]
    }

    struct CountingTool {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        behavior: Behavior,
    }

    enum Behavior {
        Fixed(Value),
        AlwaysError(&'static str),
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.into(),
                description: "test".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"q": {"type": "string"}},
                }),
            }
        }
        async fn invoke(&self, _input: Value, _ctx: &UserContext) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Fixed(v) => Ok(v.clone()),
                Behavior::AlwaysError(msg) => {
                    Err(Error::Tool { tool: self.name.into(), message: (*msg).into() })
                }
            }
        }
    }

    fn registry_with(tool: CountingTool) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(tool), true);
        registry
    }

    fn base_request(tools: Vec<Value>) -> GenerateRequest {
        GenerateRequest {
            messages: vec![ApiMessage::user("hello")],
            tools,
            ..Default::default()
        }
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        let _ = rx;
        out
    }

    #[tokio::test]
    async fn plain_text_turn_no_tools() {
        reset_failover_for_tests();
        let provider = LlmProvider::scripted(
            test_cfg(),
            None,
            vec![complete(text_response("Hello!"))],
        );
        let (tx, rx) = mpsc::channel(64);
        let msg = provider
            .generate_response(base_request(vec![]), Some(tx))
            .await
            .unwrap();
        assert_eq!(msg.text(), "Hello!");

        let events = drain(rx).await;
        let completes =
            events.iter().filter(|e| matches!(e, StreamEvent::Complete { .. })).count();
        assert_eq!(completes, 1);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolExecuting { .. })));
    }

    #[tokio::test]
    async fn single_tool_round_then_text() {
        reset_failover_for_tests();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(CountingTool {
            name: "answer_tool",
            calls: Arc::clone(&calls),
            behavior: Behavior::Fixed(serde_json::json!({"result": "42"})),
        });
        let tools = registry.definitions();

        let provider = LlmProvider::scripted(
            test_cfg(),
            Some(registry),
            vec![
                complete(tool_response("tu_1", "answer_tool", serde_json::json!({"q": "x"}))),
                complete(text_response("The answer is 42.")),
            ],
        );
        let (tx, rx) = mpsc::channel(64);
        let msg = provider
            .generate_response(base_request(tools), Some(tx))
            .await
            .unwrap();

        assert_eq!(msg.text(), "The answer is 42.");
        assert!(msg.tool_calls().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = drain(rx).await;
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                StreamEvent::ToolExecuting { .. } => "executing",
                StreamEvent::ToolCompleted { .. } => "completed",
                StreamEvent::Complete { .. } => "complete",
                StreamEvent::ToolError { .. } => "error",
                _ => "other",
            })
            .collect();
        assert!(kinds.contains(&"executing"));
        assert!(kinds.contains(&"completed"));
        assert_eq!(kinds.iter().filter(|k| **k == "complete").count(), 1);
    }

    #[tokio::test]
    async fn repeated_identical_results_trip_breaker() {
        reset_failover_for_tests();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(CountingTool {
            name: "poll_tool",
            calls: Arc::clone(&calls),
            behavior: Behavior::Fixed(serde_json::json!({"status": "pending", "data": "X"})),
        });
        let tools = registry.definitions();

        let provider = LlmProvider::scripted(
            test_cfg(),
            Some(registry),
            vec![
                complete(tool_response("tu_1", "poll_tool", serde_json::json!({}))),
                complete(tool_response("tu_2", "poll_tool", serde_json::json!({}))),
                // Forced finalization after the breaker trips.
                complete(text_response("Still pending; stopping here.")),
            ],
        );
        let (tx, rx) = mpsc::channel(64);
        let msg = provider
            .generate_response(base_request(tools), Some(tx))
            .await
            .unwrap();

        assert!(!msg.text().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let events = drain(rx).await;
        let breaker: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::CircuitBreaker { .. }))
            .collect();
        assert_eq!(breaker.len(), 1);
        match breaker[0] {
            StreamEvent::CircuitBreaker { reason } => {
                assert_eq!(reason, "Repeated identical results")
            }
            _ => unreachable!(),
        }
        assert_eq!(
            events.iter().filter(|e| matches!(e, StreamEvent::Complete { .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn tool_error_retry_then_breaker() {
        reset_failover_for_tests();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(CountingTool {
            name: "web_tool",
            calls: Arc::clone(&calls),
            behavior: Behavior::AlwaysError("External API unavailable"),
        });
        let tools = registry.definitions();

        let provider = LlmProvider::scripted(
            test_cfg(),
            Some(registry),
            vec![
                complete(tool_response("tu_1", "web_tool", serde_json::json!({}))),
                complete(tool_response("tu_2", "web_tool", serde_json::json!({}))),
                complete(text_response("I couldn't reach the web service.")),
            ],
        );
        let (tx, rx) = mpsc::channel(64);
        let msg = provider
            .generate_response(base_request(tools), Some(tx))
            .await
            .unwrap();
        assert!(!msg.text().is_empty());

        let events = drain(rx).await;
        let errors =
            events.iter().filter(|e| matches!(e, StreamEvent::ToolError { .. })).count();
        assert_eq!(errors, 2);
        let reason = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::CircuitBreaker { reason } => Some(reason.clone()),
                _ => None,
            })
            .expect("breaker event");
        assert!(reason.contains("failed after correction"));
        assert_eq!(
            events.iter().filter(|e| matches!(e, StreamEvent::Complete { .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn container_id_preserved_from_request() {
        reset_failover_for_tests();
        let provider = LlmProvider::scripted(
            test_cfg(),
            None,
            vec![complete(text_response("ok"))],
        );
        let mut req = base_request(vec![]);
        req.container_id = Some("cont_9".into());
        let msg = provider.generate_response(req, None).await.unwrap();
        assert_eq!(msg.container_id.as_deref(), Some("cont_9"));
    }

    #[tokio::test]
    async fn empty_messages_rejected() {
        reset_failover_for_tests();
        let provider = LlmProvider::scripted(test_cfg(), None, vec![]);
        let err = provider
            .generate_response(GenerateRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn whitespace_only_message_rejected() {
        reset_failover_for_tests();
        let provider = LlmProvider::scripted(test_cfg(), None, vec![]);
        let req = GenerateRequest {
            messages: vec![ApiMessage::user("   ")],
            ..Default::default()
        };
        let err = provider.generate_response(req, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn assistant_tool_use_without_text_is_valid() {
        let messages = vec![
            ApiMessage::user("hi"),
            ApiMessage::assistant(MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "search".into(),
                input: serde_json::json!({}),
            }])),
        ];
        assert!(validate_messages(&messages).is_ok());
    }

    #[tokio::test]
    async fn endpoint_url_without_model_override_rejected() {
        reset_failover_for_tests();
        let provider = LlmProvider::scripted(test_cfg(), None, vec![]);
        let req = GenerateRequest {
            messages: vec![ApiMessage::user("hi")],
            endpoint_url: Some("https://example.com/v1/chat/completions".into()),
            ..Default::default()
        };
        // Routing happens inside call_with_failover; the validation error
        // surfaces before any backend call.
        let err = provider.generate_response(req, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn schema_hint_only_for_param_shaped_errors() {
        let registry = ToolRegistry::new();
        registry.register(
            Arc::new(CountingTool {
                name: "t",
                calls: Arc::new(AtomicUsize::new(0)),
                behavior: Behavior::Fixed(Value::Null),
            }),
            true,
        );
        let param_err = Error::Validation("missing required parameter: q".into());
        assert!(schema_hint(&registry, "t", &param_err).contains("CORRECT PARAMETERS"));

        let transient =
            Error::Tool { tool: "t".into(), message: "connection reset by peer".into() };
        assert!(schema_hint(&registry, "t", &transient).is_empty());
    }

    #[test]
    fn stringify_dict_vs_string() {
        assert_eq!(stringify_result(&Value::String("plain".into())), "plain");
        assert_eq!(
            stringify_result(&serde_json::json!({"a": 1})),
            r#"{"a":1}"#
        );
    }
}
