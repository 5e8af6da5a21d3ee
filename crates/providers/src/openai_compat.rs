//! Generic OpenAI-compatible adapter.
//!
//! Presents the same stream-event surface as the native adapter but speaks
//! the chat-completions protocol, for third-party endpoints (OpenRouter,
//! Groq, local runtimes) and the emergency failover path. Unsupported block
//! types are stripped on the way out; responses are rebuilt into the native
//! message shape so everything above the adapters stays provider-neutral.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use mira_domain::error::PROVIDER_GENERIC;
use mira_domain::message::{
    ApiMessage, ContentBlock, MessageContent, ProviderMessage, Role, StopReason, Usage,
};
use mira_domain::stream::{BoxStream, StreamEvent};
use mira_domain::tool::{is_server_side_tool, TOOL_LOADER_NAME};
use mira_domain::{Error, Result};

use crate::provider::CallSpec;
use crate::sse::sse_response_stream;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Native → OpenAI conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert the native message list to chat-completions messages.
///
/// Tool-result blocks inside user messages become individual
/// `{role:"tool"}` messages (emitted in place, before any remaining user
/// text from the same message). Thinking blocks never cross this boundary;
/// `reasoning_details` on assistant messages are replayed verbatim.
pub(crate) fn messages_to_openai(messages: &[ApiMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    for msg in messages {
        match msg.role {
            Role::System => {
                out.push(serde_json::json!({
                    "role": "system",
                    "content": msg.content.extract_all_text(),
                }));
            }
            Role::Assistant => out.push(assistant_to_openai(msg)),
            Role::User => user_to_openai(msg, &mut out),
        }
    }

    out
}

fn assistant_to_openai(msg: &ApiMessage) -> Value {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text, .. } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    // Thinking blocks never cross the generic boundary.
                    _ => {}
                }
            }
        }
    }

    let mut obj = serde_json::json!({"role": "assistant"});
    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    if let Some(details) = &msg.reasoning_details {
        obj["reasoning_details"] = Value::Array(details.clone());
    }
    obj
}

fn user_to_openai(msg: &ApiMessage, out: &mut Vec<Value>) {
    match &msg.content {
        MessageContent::Text(t) => {
            out.push(serde_json::json!({"role": "user", "content": t}));
        }
        MessageContent::Blocks(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::ToolResult { tool_use_id, content, .. } => {
                        out.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                    ContentBlock::Text { text, .. } => text_parts.push(text.clone()),
                    ContentBlock::ContainerUpload { file_id } => {
                        text_parts.push(format!(
                            "[File upload not supported by this provider: {file_id}]"
                        ));
                    }
                    // Images and documents are dropped; the text fallback
                    // already describes them upstream.
                    _ => {}
                }
            }
            if !text_parts.is_empty() {
                out.push(serde_json::json!({
                    "role": "user",
                    "content": text_parts.join("\n"),
                }));
            }
        }
    }
}

/// Filter server-side tools out and strip cache markers; wrap the rest in
/// the chat-completions function envelope.
pub(crate) fn tools_to_openai(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter(|t| !is_server_side_tool(t))
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.get("name").cloned().unwrap_or(Value::Null),
                    "description": t.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": t.get("input_schema").cloned().unwrap_or(Value::Null),
                }
            })
        })
        .collect()
}

fn build_chat_body(spec: &CallSpec, model: &str) -> Value {
    let (system, rest) = crate::anthropic::split_system(&spec.messages);
    let mut messages = Vec::new();
    if let Some(sys) = system {
        messages.push(serde_json::json!({
            "role": "system",
            "content": sys.extract_all_text(),
        }));
    }
    let rest_owned: Vec<ApiMessage> = rest.into_iter().cloned().collect();
    messages.extend(messages_to_openai(&rest_owned));

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "temperature": spec.temperature,
        "max_tokens": spec.max_tokens,
        "stream_options": {"include_usage": true},
    });

    let tools = tools_to_openai(&spec.tools);
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }
    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    args: String,
}

struct StreamState {
    text: String,
    calls: BTreeMap<u64, PartialCall>,
    detected: HashSet<u64>,
    reasoning_details: Vec<Value>,
    finish_reason: Option<String>,
    usage: Usage,
    /// Tool names present in the outgoing request; calls to anything else
    /// trigger the tool-loader synthesis.
    known_tools: HashSet<String>,
    complete_emitted: bool,
}

impl StreamState {
    fn new(known_tools: HashSet<String>) -> Self {
        Self {
            text: String::new(),
            calls: BTreeMap::new(),
            detected: HashSet::new(),
            reasoning_details: Vec::new(),
            finish_reason: None,
            usage: Usage::default(),
            known_tools,
            complete_emitted: false,
        }
    }

    fn assemble(&mut self) -> ProviderMessage {
        let mut content: Vec<ContentBlock> = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::text(std::mem::take(&mut self.text)));
        }

        let calls = std::mem::take(&mut self.calls);
        // Tool-not-loaded synthesis: a call to a tool absent from the
        // request becomes a single tool-loader invocation instead.
        if let Some(missing) = calls
            .values()
            .find(|c| !c.name.is_empty() && !self.known_tools.contains(&c.name))
        {
            tracing::info!(tool = %missing.name, "model called unloaded tool; synthesizing loader call");
            return ProviderMessage {
                content: vec![ContentBlock::ToolUse {
                    id: format!("toolu_{}", &uuid::Uuid::new_v4().simple().to_string()[..24]),
                    name: TOOL_LOADER_NAME.into(),
                    input: serde_json::json!({"mode": "load", "query": missing.name}),
                }],
                stop_reason: Some(StopReason::ToolUse),
                usage: self.usage.clone(),
                container_id: None,
                reasoning_details: None,
            };
        }

        for (_, call) in calls {
            let input: Value = if call.args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.args).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, tool = %call.name, "tool arguments are not valid JSON");
                    Value::Object(Default::default())
                })
            };
            content.push(ContentBlock::ToolUse { id: call.id, name: call.name, input });
        }

        let stop_reason = match self.finish_reason.as_deref() {
            Some("tool_calls") => Some(StopReason::ToolUse),
            Some("length") => Some(StopReason::MaxTokens),
            Some(_) | None => Some(StopReason::EndTurn),
        };

        ProviderMessage {
            content,
            stop_reason,
            usage: self.usage.clone(),
            container_id: None,
            reasoning_details: if self.reasoning_details.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.reasoning_details))
            },
        }
    }
}

/// Parse one chat-completions SSE payload into zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    if data == "[DONE]" {
        if !state.complete_emitted {
            state.complete_emitted = true;
            let response = state.assemble();
            events.push(Ok(StreamEvent::Complete { response }));
        }
        return events;
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    // Usage arrives on a trailing chunk with empty choices.
    if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
        if let Some(n) = u.get("prompt_tokens").and_then(|x| x.as_u64()) {
            state.usage.input_tokens = n as u32;
        }
        if let Some(n) = u.get("completion_tokens").and_then(|x| x.as_u64()) {
            state.usage.output_tokens = n as u32;
        }
    }

    let Some(choice) = v.get("choices").and_then(|c| c.get(0)) else {
        return events;
    };

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        state.finish_reason = Some(reason.to_string());
    }

    let Some(delta) = choice.get("delta") else {
        return events;
    };

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            state.text.push_str(text);
            events.push(Ok(StreamEvent::Text { content: text.to_string() }));
        }
    }

    // Reasoning text streams as thinking; reasoning_details accumulate for
    // the round-trip required by some hosted reasoning models.
    if let Some(reasoning) = delta.get("reasoning").and_then(|r| r.as_str()) {
        if !reasoning.is_empty() {
            events.push(Ok(StreamEvent::Thinking { content: reasoning.to_string() }));
        }
    }
    if let Some(details) = delta.get("reasoning_details").and_then(|d| d.as_array()) {
        state.reasoning_details.extend(details.iter().cloned());
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let idx = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let entry = state.calls.entry(idx).or_default();
            if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                if !id.is_empty() {
                    entry.id = id.to_string();
                }
            }
            if let Some(name) = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                if !name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
            {
                entry.args.push_str(args);
            }
            // Emit ToolDetected once per index, as soon as we have a name.
            if !state.detected.contains(&idx) && !state.calls[&idx].name.is_empty() {
                state.detected.insert(idx);
                let call = &state.calls[&idx];
                events.push(Ok(StreamEvent::ToolDetected {
                    tool_name: call.name.clone(),
                    tool_id: call.id.clone(),
                }));
            }
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute one streaming chat-completions call.
pub(crate) async fn stream_call(
    client: &reqwest::Client,
    endpoint_url: &str,
    api_key: Option<&str>,
    model: &str,
    spec: &CallSpec,
    context_window: u64,
) -> Result<BoxStream<'static, Result<StreamEvent>>> {
    let body = build_chat_body(spec, model);

    tracing::debug!(endpoint = endpoint_url, model, "generic stream request");

    let mut builder = client
        .post(endpoint_url)
        .header("Content-Type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("Authorization", format!("Bearer {key}"));
    }

    let resp = builder.json(&body).send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Timeout("Request timed out".into())
        } else {
            Error::Upstream { service: PROVIDER_GENERIC.into(), message: e.to_string() }
        }
    })?;

    let status = resp.status();
    if !status.is_success() {
        let err_text = resp.text().await.unwrap_or_default();
        let status = status.as_u16();
        if status == 400 && Error::is_overflow_message(&err_text) {
            return Err(Error::ContextOverflow {
                estimated_tokens: 0,
                context_window,
                provider: PROVIDER_GENERIC,
            });
        }
        return Err(match status {
            401 => Error::PermissionDenied("Invalid API key".into()),
            429 => Error::RateLimited("Rate limit exceeded. Please try again later.".into()),
            s if s >= 500 => Error::Upstream {
                service: PROVIDER_GENERIC.into(),
                message: format!("HTTP {s} - {err_text}"),
            },
            s => Error::Validation(format!("API error ({s}): {err_text}")),
        });
    }

    let known_tools: HashSet<String> = spec
        .tools
        .iter()
        .filter_map(|t| t.get("name").and_then(|n| n.as_str()).map(String::from))
        .collect();

    let mut state = StreamState::new(known_tools);
    Ok(sse_response_stream(resp, move |data| parse_sse(data, &mut state)))
}
