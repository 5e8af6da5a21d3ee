//! Provider-neutral LLM access.
//!
//! [`LlmProvider`] is the single public surface for generation: it routes
//! between the Anthropic-native adapter and the generic OpenAI-compatible
//! adapter, enforces the process-wide failover flag, and runs the tool loop
//! under circuit-breaker guarding. Both adapters emit the same
//! [`mira_domain::stream::StreamEvent`] vocabulary.

mod anthropic;
mod firehose;
mod openai_compat;
mod sse;

pub mod circuit_breaker;
pub mod provider;

pub use circuit_breaker::CircuitBreaker;
pub use provider::{GenerateRequest, LlmClient, LlmProvider};
