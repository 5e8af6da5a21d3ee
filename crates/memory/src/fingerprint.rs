//! Fingerprint generation: expand the user's turn into a
//! retrieval-optimized query and vote on retention of previously surfaced
//! memories.
//!
//! One utility-model call per turn. Failures propagate — there is no
//! degraded path, because retrieval quality silently collapsing is worse
//! than a visible error.

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use mira_domain::message::ApiMessage;
use mira_domain::tags::format_memory_id;
use mira_domain::{Error, Result};
use mira_providers::{GenerateRequest, LlmClient};

use crate::types::MemoryRecord;

/// How much trailing conversation the fingerprint prompt sees.
const MAX_CONTEXT_MESSAGES: usize = 6;
const MAX_MESSAGE_CHARS: usize = 400;

/// A recent conversation line for fingerprint context.
#[derive(Debug, Clone)]
pub struct ConversationSnippet {
    pub role: String,
    pub text: String,
}

pub struct FingerprintGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

fn vote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\[x\]\s*mem_([0-9a-fA-F]{8}).*$").unwrap())
}

impl FingerprintGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// Generate `(fingerprint, pinned_short_ids)` for a turn.
    pub async fn generate(
        &self,
        recent: &[ConversationSnippet],
        user_text: &str,
        previous_memories: &[MemoryRecord],
    ) -> Result<(String, HashSet<String>)> {
        let prompt = build_prompt(recent, user_text, previous_memories);

        let req = GenerateRequest {
            messages: vec![ApiMessage::user(prompt)],
            model_override: Some(self.model.clone()),
            thinking_enabled: Some(false),
            temperature: Some(0.1),
            ..Default::default()
        };

        let response = self.llm.generate_response(req, None).await?;
        let text = response.text();
        let (fingerprint, pinned) = parse_fingerprint_response(&text);

        if fingerprint.is_empty() {
            return Err(Error::Other(
                "fingerprint generation returned an empty retrieval query".into(),
            ));
        }

        tracing::debug!(
            fingerprint_len = fingerprint.len(),
            pinned = pinned.len(),
            "fingerprint generated"
        );
        Ok((fingerprint, pinned))
    }
}

fn build_prompt(
    recent: &[ConversationSnippet],
    user_text: &str,
    previous_memories: &[MemoryRecord],
) -> String {
    let mut out = String::from(
        "You expand a user's latest message into a retrieval query for their long-term \
         memory store, using the conversation for context.\n\n",
    );

    if !recent.is_empty() {
        out.push_str("RECENT CONVERSATION:\n");
        let start = recent.len().saturating_sub(MAX_CONTEXT_MESSAGES);
        for snippet in &recent[start..] {
            let text: String = snippet.text.chars().take(MAX_MESSAGE_CHARS).collect();
            out.push_str(&format!("[{}]: {}\n", snippet.role, text));
        }
        out.push('\n');
    }

    out.push_str(&format!("LATEST MESSAGE:\n{user_text}\n\n"));

    if !previous_memories.is_empty() {
        out.push_str(
            "MEMORIES CURRENTLY IN CONTEXT (mark [x] next to any that should STAY in \
             context for the next reply; leave the rest unmarked):\n",
        );
        for memory in previous_memories {
            let text: String = memory.text.chars().take(200).collect();
            out.push_str(&format!("[ ] {} — {}\n", format_memory_id(&memory.id), text));
        }
        out.push('\n');
    }

    out.push_str(
        "Write a specific retrieval query (1-3 sentences) that would surface the memories \
         most useful for answering the latest message. Expand fragments into concrete \
         specifics. Then repeat any checkbox lines you are marking, exactly as shown but \
         with [x].",
    );
    out
}

/// Split a fingerprint response into the query text and the voted IDs.
fn parse_fingerprint_response(text: &str) -> (String, HashSet<String>) {
    let pinned: HashSet<String> = vote_re()
        .captures_iter(text)
        .map(|c| c[1].to_lowercase())
        .collect();

    let fingerprint = vote_re().replace_all(text, "").trim().to_string();
    (fingerprint, pinned)
}
