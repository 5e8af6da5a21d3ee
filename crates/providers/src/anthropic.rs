//! Anthropic-native adapter.
//!
//! Speaks the Messages streaming API: system prompt as a separate top-level
//! parameter, content-block streams, prompt-cache markers, extended
//! thinking, and container reuse for server-side code execution.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use mira_domain::config::{ApiConfig, HAIKU_MAX_OUTPUT_TOKENS};
use mira_domain::error::PROVIDER_ANTHROPIC;
use mira_domain::message::{
    ApiMessage, ContentBlock, MessageContent, ProviderMessage, Role, StopReason, Usage,
};
use mira_domain::stream::{BoxStream, StreamEvent};
use mira_domain::{Error, Result};

use crate::provider::CallSpec;
use crate::sse::sse_response_stream;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Beta surface for server-side code execution and the Files API.
const ANTHROPIC_BETA_FLAGS: &str = "code-execution-2025-08-25,files-api-2025-04-14";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract the system prompt (first system message) from the message list.
/// Remaining messages keep their order.
pub(crate) fn split_system(messages: &[ApiMessage]) -> (Option<MessageContent>, Vec<&ApiMessage>) {
    let mut system = None;
    let mut rest = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == Role::System && system.is_none() {
            system = Some(msg.content.clone());
        } else {
            rest.push(msg);
        }
    }
    (system, rest)
}

/// Keep a content block when preparing an assistant message for send.
///
/// Thinking disabled: strip every thinking block. Thinking enabled: strip
/// only blocks without a provider signature (generic-adapter thinking would
/// be rejected by the native API).
fn keep_block(block: &ContentBlock, use_thinking: bool) -> bool {
    match block {
        ContentBlock::Thinking { signature, .. } => use_thinking && signature.is_some(),
        _ => true,
    }
}

fn message_to_value(msg: &ApiMessage, use_thinking: bool) -> Value {
    let content = match &msg.content {
        MessageContent::Text(t) => Value::String(t.clone()),
        MessageContent::Blocks(blocks) => {
            let kept: Vec<Value> = blocks
                .iter()
                .filter(|b| keep_block(b, use_thinking))
                .map(|b| serde_json::to_value(b).unwrap_or(Value::Null))
                .collect();
            Value::Array(kept)
        }
    };
    serde_json::json!({
        "role": msg.role.as_str(),
        "content": content,
    })
}

/// Mark the last tool definition for prompt caching (caches the whole list).
fn prepare_tools_for_caching(tools: &[Value], caching: bool) -> Vec<Value> {
    let mut out = tools.to_vec();
    if caching {
        if let Some(last) = out.last_mut() {
            last["cache_control"] = serde_json::json!({"type": "ephemeral"});
        }
    }
    out
}

/// Build the Messages API request body for one call.
pub(crate) fn build_request_body(spec: &CallSpec, stream: bool) -> Value {
    let (system, rest) = split_system(&spec.messages);

    // Small-context model families are clamped to their output ceiling.
    let mut max_tokens = spec.max_tokens;
    if spec.model.to_lowercase().contains("haiku") && max_tokens > HAIKU_MAX_OUTPUT_TOKENS {
        max_tokens = HAIKU_MAX_OUTPUT_TOKENS;
    }
    if spec.thinking_enabled {
        max_tokens += spec.thinking_budget;
    }

    let api_messages: Vec<Value> = rest
        .iter()
        .map(|m| message_to_value(m, spec.thinking_enabled))
        .collect();

    let mut body = serde_json::json!({
        "model": spec.model,
        "max_tokens": max_tokens,
        "messages": api_messages,
        "temperature": spec.temperature,
        "stream": stream,
    });

    // System parameter: structured blocks pass through; a bare string is
    // wrapped as a single cached block when caching is enabled.
    match system {
        Some(MessageContent::Blocks(blocks)) => {
            body["system"] = serde_json::to_value(&blocks).unwrap_or(Value::Null);
        }
        Some(MessageContent::Text(t)) if !t.is_empty() => {
            if spec.enable_prompt_caching {
                body["system"] = serde_json::json!([{
                    "type": "text",
                    "text": t,
                    "cache_control": {"type": "ephemeral"},
                }]);
            } else {
                body["system"] = Value::String(t);
            }
        }
        _ => {}
    }

    if !spec.tools.is_empty() {
        body["tools"] =
            Value::Array(prepare_tools_for_caching(&spec.tools, spec.enable_prompt_caching));
    }

    if spec.thinking_enabled {
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": spec.thinking_budget,
        });
    }

    if let Some(container) = &spec.container_id {
        body["container"] = Value::String(container.clone());
    }

    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn map_status_error(status: u16, body: &str, context_window: u64) -> Error {
    if status == 400 && Error::is_overflow_message(body) {
        return Error::ContextOverflow {
            estimated_tokens: 0,
            context_window,
            provider: PROVIDER_ANTHROPIC,
        };
    }
    match status {
        400 => Error::Validation(format!("API error (400): {body}")),
        401 => Error::PermissionDenied("Invalid API key".into()),
        429 => Error::RateLimited("Rate limit exceeded. Please try again later.".into()),
        s if s >= 500 => Error::Upstream {
            service: PROVIDER_ANTHROPIC.into(),
            message: format!("HTTP {s} - {body}"),
        },
        s => Error::Validation(format!("API error ({s}): {body}")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum PartialBlock {
    Text(String),
    Thinking { text: String, signature: Option<String> },
    ToolUse { id: String, name: String, args: String },
}

/// Mutable assembly state across SSE payloads.
struct StreamState {
    blocks: BTreeMap<u64, PartialBlock>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    container_id: Option<String>,
    request_container_id: Option<String>,
    tool_ids_seen: HashSet<String>,
    model: String,
    complete_emitted: bool,
}

impl StreamState {
    fn new(model: String, request_container_id: Option<String>) -> Self {
        Self {
            blocks: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            container_id: None,
            request_container_id,
            tool_ids_seen: HashSet::new(),
            model,
            complete_emitted: false,
        }
    }

    fn assemble(&mut self) -> ProviderMessage {
        let content: Vec<ContentBlock> = std::mem::take(&mut self.blocks)
            .into_values()
            .map(|b| match b {
                PartialBlock::Text(text) => ContentBlock::Text { text, cache_control: None },
                PartialBlock::Thinking { text, signature } => {
                    ContentBlock::Thinking { thinking: text, signature }
                }
                PartialBlock::ToolUse { id, name, args } => {
                    let input: Value = if args.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&args).unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "tool_use input is not valid JSON");
                            Value::Object(Default::default())
                        })
                    };
                    ContentBlock::ToolUse { id, name, input }
                }
            })
            .collect();

        // Container preservation: keep the request's id even when the
        // provider does not echo one back.
        let container_id = self.container_id.clone().or_else(|| self.request_container_id.clone());

        if self.usage.cache_creation_input_tokens > 0 {
            tracing::info!(
                tokens = self.usage.cache_creation_input_tokens,
                "prompt cache created"
            );
        }
        if self.usage.cache_read_input_tokens > 0 {
            tracing::debug!(tokens = self.usage.cache_read_input_tokens, "prompt cache read");
        }
        tracing::debug!(
            model = %self.model,
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            "anthropic response complete"
        );

        ProviderMessage {
            content,
            stop_reason: self.stop_reason,
            usage: self.usage.clone(),
            container_id,
            reasoning_details: None,
        }
    }
}

fn parse_usage(v: &Value, usage: &mut Usage) {
    if let Some(n) = v.get("input_tokens").and_then(|x| x.as_u64()) {
        usage.input_tokens = n as u32;
    }
    if let Some(n) = v.get("output_tokens").and_then(|x| x.as_u64()) {
        usage.output_tokens = n as u32;
    }
    if let Some(n) = v.get("cache_creation_input_tokens").and_then(|x| x.as_u64()) {
        usage.cache_creation_input_tokens = n as u32;
    }
    if let Some(n) = v.get("cache_read_input_tokens").and_then(|x| x.as_u64()) {
        usage.cache_read_input_tokens = n as u32;
    }
}

fn parse_stop_reason(s: &str) -> Option<StopReason> {
    match s {
        "end_turn" => Some(StopReason::EndTurn),
        "tool_use" => Some(StopReason::ToolUse),
        "max_tokens" => Some(StopReason::MaxTokens),
        _ => None,
    }
}

/// Parse a single Anthropic SSE payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    match v.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                if let Some(u) = msg.get("usage") {
                    parse_usage(u, &mut state.usage);
                }
                if let Some(id) = msg
                    .get("container")
                    .and_then(|c| c.get("id"))
                    .and_then(|i| i.as_str())
                {
                    state.container_id = Some(id.to_string());
                }
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        state.blocks.insert(idx, PartialBlock::Text(String::new()));
                    }
                    "thinking" => {
                        state.blocks.insert(
                            idx,
                            PartialBlock::Thinking { text: String::new(), signature: None },
                        );
                    }
                    "tool_use" | "server_tool_use" => {
                        let id = block.get("id").and_then(|x| x.as_str()).unwrap_or("").to_string();
                        let name =
                            block.get("name").and_then(|x| x.as_str()).unwrap_or("").to_string();
                        // One ToolDetected per tool id.
                        if state.tool_ids_seen.insert(id.clone()) {
                            events.push(Ok(StreamEvent::ToolDetected {
                                tool_name: name.clone(),
                                tool_id: id.clone(),
                            }));
                        }
                        state
                            .blocks
                            .insert(idx, PartialBlock::ToolUse { id, name, args: String::new() });
                    }
                    _ => {}
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                if let Some(PartialBlock::Text(buf)) = state.blocks.get_mut(&idx) {
                                    buf.push_str(text);
                                }
                                events.push(Ok(StreamEvent::Text { content: text.to_string() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|t| t.as_str()) {
                            if let Some(PartialBlock::Thinking { text: buf, .. }) =
                                state.blocks.get_mut(&idx)
                            {
                                buf.push_str(text);
                            }
                            events.push(Ok(StreamEvent::Thinking { content: text.to_string() }));
                        }
                    }
                    "signature_delta" => {
                        if let Some(sig) = delta.get("signature").and_then(|s| s.as_str()) {
                            if let Some(PartialBlock::Thinking { signature, .. }) =
                                state.blocks.get_mut(&idx)
                            {
                                *signature = Some(sig.to_string());
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|p| p.as_str()) {
                            if let Some(PartialBlock::ToolUse { args, .. }) =
                                state.blocks.get_mut(&idx)
                            {
                                args.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "message_delta" => {
            if let Some(u) = v.get("usage") {
                parse_usage(u, &mut state.usage);
            }
            if let Some(reason) = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|s| s.as_str())
            {
                state.stop_reason = parse_stop_reason(reason);
            }
        }

        "message_stop" => {
            if !state.complete_emitted {
                state.complete_emitted = true;
                let response = state.assemble();
                events.push(Ok(StreamEvent::Complete { response }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            events.push(Err(Error::Upstream {
                service: PROVIDER_ANTHROPIC.into(),
                message: msg.to_string(),
            }));
        }

        // ping or unknown event types -- ignore.
        _ => {}
    }

    events
}

/// Execute one streaming Messages API call.
pub(crate) async fn stream_call(
    client: &reqwest::Client,
    cfg: &ApiConfig,
    api_key: &str,
    spec: &CallSpec,
) -> Result<BoxStream<'static, Result<StreamEvent>>> {
    let url = format!("{}/v1/messages", cfg.base_url.trim_end_matches('/'));
    let body = build_request_body(spec, true);

    tracing::debug!(model = %spec.model, url = %url, "anthropic stream request");

    let resp = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", ANTHROPIC_BETA_FLAGS)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout("Request timed out".into())
            } else {
                Error::Upstream { service: PROVIDER_ANTHROPIC.into(), message: e.to_string() }
            }
        })?;

    let status = resp.status();
    if !status.is_success() {
        let err_text = resp.text().await.unwrap_or_default();
        return Err(map_status_error(status.as_u16(), &err_text, cfg.context_window_tokens));
    }

    let mut state = StreamState::new(spec.model.clone(), spec.container_id.clone());
    Ok(sse_response_stream(resp, move |data| parse_sse(data, &mut state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_domain::message::UserContext;

    fn spec(messages: Vec<ApiMessage>, tools: Vec<Value>) -> CallSpec {
        CallSpec {
            messages,
            tools,
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 8192,
            temperature: 0.7,
            thinking_enabled: false,
            thinking_budget: 4096,
            container_id: None,
            enable_prompt_caching: true,
            user: UserContext::default(),
        }
    }

    #[test]
    fn system_string_wrapped_as_cached_block() {
        let body = build_request_body(
            &spec(
                vec![ApiMessage::system("You are MIRA."), ApiMessage::user("hi")],
                vec![],
            ),
            true,
        );
        assert_eq!(body["system"][0]["text"], "You are MIRA.");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn system_blocks_pass_through() {
        let sys = MessageContent::Blocks(vec![
            ContentBlock::cached_text("cached part"),
            ContentBlock::text("dynamic part"),
        ]);
        let body = build_request_body(
            &spec(vec![ApiMessage::system(sys), ApiMessage::user("hi")], vec![]),
            false,
        );
        let blocks = body["system"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].get("cache_control").is_some());
        assert!(blocks[1].get("cache_control").is_none());
    }

    #[test]
    fn last_tool_gets_cache_marker() {
        let tools = vec![
            serde_json::json!({"name": "a", "description": "", "input_schema": {}}),
            serde_json::json!({"name": "b", "description": "", "input_schema": {}}),
        ];
        let body = build_request_body(&spec(vec![ApiMessage::user("hi")], tools), true);
        let tools = body["tools"].as_array().unwrap();
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn haiku_clamps_max_tokens() {
        let mut s = spec(vec![ApiMessage::user("hi")], vec![]);
        s.model = "claude-3-5-haiku-20241022".into();
        s.max_tokens = 16_000;
        let body = build_request_body(&s, false);
        assert_eq!(body["max_tokens"], 8192);
    }

    #[test]
    fn thinking_budget_raises_max_tokens() {
        let mut s = spec(vec![ApiMessage::user("hi")], vec![]);
        s.thinking_enabled = true;
        s.thinking_budget = 2048;
        let body = build_request_body(&s, false);
        assert_eq!(body["max_tokens"], 8192 + 2048);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn thinking_disabled_strips_all_thinking_blocks() {
        let assistant = ApiMessage::assistant(MessageContent::Blocks(vec![
            ContentBlock::Thinking { thinking: "hmm".into(), signature: Some("sig".into()) },
            ContentBlock::text("answer"),
        ]));
        let body =
            build_request_body(&spec(vec![assistant, ApiMessage::user("next")], vec![]), false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0]["type"], "text");
    }

    #[test]
    fn thinking_enabled_strips_only_unsigned_blocks() {
        let assistant = ApiMessage::assistant(MessageContent::Blocks(vec![
            ContentBlock::Thinking { thinking: "native".into(), signature: Some("sig".into()) },
            ContentBlock::Thinking { thinking: "generic".into(), signature: None },
            ContentBlock::text("answer"),
        ]));
        let mut s = spec(vec![assistant, ApiMessage::user("next")], vec![]);
        s.thinking_enabled = true;
        let body = build_request_body(&s, false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "thinking");
        assert_eq!(content[1]["type"], "text");
    }

    #[test]
    fn container_id_included() {
        let mut s = spec(vec![ApiMessage::user("hi")], vec![]);
        s.container_id = Some("cont_123".into());
        let body = build_request_body(&s, true);
        assert_eq!(body["container"], "cont_123");
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status_error(400, "prompt is too long: 250000 tokens > 200000", 200_000),
            Error::ContextOverflow { provider: "anthropic", .. }
        ));
        assert!(matches!(map_status_error(401, "bad key", 0), Error::PermissionDenied(_)));
        assert!(matches!(map_status_error(429, "slow down", 0), Error::RateLimited(_)));
        assert!(matches!(map_status_error(503, "overloaded", 0), Error::Upstream { .. }));
        assert!(matches!(map_status_error(400, "invalid model", 0), Error::Validation(_)));
    }

    // ── SSE parsing ────────────────────────────────────────────────

    fn run_parse(payloads: &[&str]) -> (Vec<StreamEvent>, StreamState) {
        let mut state = StreamState::new("m".into(), None);
        let mut events = Vec::new();
        for p in payloads {
            for ev in parse_sse(p, &mut state) {
                events.push(ev.unwrap());
            }
        }
        (events, state)
    }

    #[test]
    fn parses_text_stream_with_usage() {
        let (events, _) = run_parse(&[
            r#"{"type":"message_start","message":{"usage":{"input_tokens":10,"cache_read_input_tokens":5}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let texts: Vec<&StreamEvent> =
            events.iter().filter(|e| matches!(e, StreamEvent::Text { .. })).collect();
        assert_eq!(texts.len(), 2);

        let StreamEvent::Complete { response } = events.last().unwrap() else {
            panic!("expected Complete terminal");
        };
        assert_eq!(response.text(), "Hello");
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.output_tokens, 2);
        assert_eq!(response.usage.cache_read_input_tokens, 5);
    }

    #[test]
    fn parses_tool_use_with_one_detected_per_id() {
        let (events, _) = run_parse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"search"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":8}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let detected: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolDetected { .. }))
            .collect();
        assert_eq!(detected.len(), 1);

        let StreamEvent::Complete { response } = events.last().unwrap() else {
            panic!("expected Complete terminal");
        };
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tu_1");
        assert_eq!(calls[0].input["q"], "rust");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn parses_thinking_with_signature() {
        let (events, _) = run_parse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"let me think"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_abc"}}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"done"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Thinking { .. })));
        let StreamEvent::Complete { response } = events.last().unwrap() else {
            panic!("expected Complete terminal");
        };
        match &response.content[0] {
            ContentBlock::Thinking { thinking, signature } => {
                assert_eq!(thinking, "let me think");
                assert_eq!(signature.as_deref(), Some("sig_abc"));
            }
            other => panic!("expected thinking block, got {other:?}"),
        }
    }

    #[test]
    fn request_container_preserved_when_not_echoed() {
        let mut state = StreamState::new("m".into(), Some("cont_req".into()));
        for p in [r#"{"type":"message_stop"}"#] {
            let _ = parse_sse(p, &mut state);
        }
        // assemble ran inside message_stop handling; re-run for direct check
        let mut state = StreamState::new("m".into(), Some("cont_req".into()));
        let msg = state.assemble();
        assert_eq!(msg.container_id.as_deref(), Some("cont_req"));
    }

    #[test]
    fn unicode_text_round_trips() {
        let (events, _) = run_parse(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"héllo — мир 🌍"}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let StreamEvent::Complete { response } = events.last().unwrap() else {
            panic!("expected Complete terminal");
        };
        assert_eq!(response.text(), "héllo — мир 🌍");
    }
}
