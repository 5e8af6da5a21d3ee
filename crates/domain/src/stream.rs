//! Events emitted during LLM streaming (provider-agnostic).
//!
//! Exactly one terminal event per stream: `Complete` on success or `Error`
//! on failure. Tool events bracket every local tool execution so callers can
//! drive progress UIs without understanding the wire protocol.

use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;

use crate::message::ProviderMessage;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "text")]
    Text { content: String },

    /// Extended-thinking content.
    #[serde(rename = "thinking")]
    Thinking { content: String },

    /// A tool_use content block appeared in the stream.
    #[serde(rename = "tool_detected")]
    ToolDetected { tool_name: String, tool_id: String },

    /// A local tool execution is starting.
    #[serde(rename = "tool_executing")]
    ToolExecuting {
        tool_name: String,
        tool_id: String,
        arguments: Value,
    },

    /// A local tool execution finished successfully.
    #[serde(rename = "tool_completed")]
    ToolCompleted {
        tool_name: String,
        tool_id: String,
        result: String,
    },

    /// A local tool execution failed.
    #[serde(rename = "tool_error")]
    ToolError {
        tool_name: String,
        tool_id: String,
        error: String,
    },

    /// The circuit breaker stopped the tool loop.
    #[serde(rename = "circuit_breaker")]
    CircuitBreaker { reason: String },

    /// A provider call is being retried.
    #[serde(rename = "retry")]
    Retry { attempt: u32, reason: String },

    /// Terminal: the final assembled assistant response.
    #[serde(rename = "complete")]
    Complete { response: ProviderMessage },

    /// Terminal: generation failed.
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        technical_details: Option<String>,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}
