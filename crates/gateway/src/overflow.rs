//! Context-overflow detection and tiered remediation.
//!
//! Tier 1 forces memory evacuation (shrinks the system prompt, keeps the
//! conversation). Tier 2 prunes at a topic-drift boundary found by sliding
//! -window embedding similarity, and schedules an async LLM judgment whose
//! result is applied one-shot on the next request. Tier 3 drops oldest
//! messages. The system message at index 0 survives every tier.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use mira_domain::config::ContextConfig;
use mira_domain::message::ApiMessage;
use mira_domain::Result;
use mira_memory::relevance::cosine_similarity;
use mira_memory::{Embeddings, MemoryRecord};
use mira_providers::{GenerateRequest, LlmClient};

/// Chars of each message considered for drift embedding.
const DRIFT_WINDOW_CHARS: usize = 500;
/// Chars of preview shown per message to the judgment model.
const JUDGMENT_PREVIEW_CHARS: usize = 200;
/// Candidate boundaries offered to the judgment model.
const MAX_JUDGMENT_CANDIDATES: usize = 5;

/// Optional collaborator that curates pinned memories under pressure.
pub trait MemoryEvacuator: Send + Sync {
    fn should_evacuate(&self, memories: &[MemoryRecord]) -> bool;
    fn evacuate(&self, memories: &[MemoryRecord], user_text: &str) -> Vec<MemoryRecord>;
}

/// One-shot context trims decided asynchronously, keyed by continuum.
pub type PendingTrims = Arc<Mutex<HashMap<Uuid, usize>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Estimate tokens for the upcoming request. The previous turn's actual
/// input count is the best baseline; otherwise chars/4. Tools add ~100
/// tokens each, and 5% covers formatting overhead.
pub fn estimate_request_tokens(
    messages: &[ApiMessage],
    tools: &[Value],
    last_turn_input_tokens: Option<u32>,
) -> u64 {
    let base = match last_turn_input_tokens {
        Some(actual) => actual as u64,
        None => {
            let chars: usize = messages
                .iter()
                .map(|m| m.content.extract_all_text().len())
                .sum();
            (chars / 4) as u64
        }
    };
    let tool_tokens = tools.len() as u64 * 100;
    ((base + tool_tokens) as f64 * 1.05) as u64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topic-drift pruning (tier 2)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct DriftCut {
    /// Index into the content messages (system excluded).
    pub index: usize,
    pub similarity: f32,
    pub drop: f32,
}

#[derive(Debug, Clone)]
pub struct DriftAnalysis {
    pub candidate_cuts: Vec<DriftCut>,
    pub selected_index: Option<usize>,
    pub selection_method: &'static str,
}

fn window_text(messages: &[ApiMessage], start: usize, size: usize) -> String {
    messages[start..start + size]
        .iter()
        .map(|m| {
            m.content
                .extract_all_text()
                .chars()
                .take(DRIFT_WINDOW_CHARS)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Find candidate drift cuts over the content messages.
async fn drift_candidates(
    embeddings: &dyn Embeddings,
    content_messages: &[ApiMessage],
    cfg: &ContextConfig,
) -> Result<Vec<DriftCut>> {
    let window_size = cfg.topic_drift_window_size;
    let mut windows: Vec<(usize, Vec<f32>)> = Vec::new();
    for start in 0..=(content_messages.len() - window_size) {
        let text = window_text(content_messages, start, window_size);
        let embedding = embeddings.encode_realtime(&text).await?;
        windows.push((start, embedding));
    }

    let mut cuts = Vec::new();
    for i in (1..windows.len()).rev() {
        let similarity = cosine_similarity(&windows[i].1, &windows[i - 1].1);
        let drop = 1.0 - similarity;
        if drop > 1.0 - cfg.topic_drift_threshold {
            cuts.push(DriftCut { index: windows[i].0, similarity, drop });
        }
    }
    Ok(cuts)
}

/// Tier-2 pruning: cut at the largest similarity drop, or fall back to
/// dropping the oldest messages. The system message survives.
pub async fn prune_by_topic_drift(
    embeddings: &dyn Embeddings,
    messages: &[ApiMessage],
    cfg: &ContextConfig,
) -> Result<(Vec<ApiMessage>, DriftAnalysis)> {
    let window_size = cfg.topic_drift_window_size;
    let fallback = |method: &'static str| {
        let keep_from = (cfg.overflow_fallback_prune_count + 1).min(messages.len());
        let mut out = vec![messages[0].clone()];
        out.extend_from_slice(&messages[keep_from..]);
        (
            out,
            DriftAnalysis { candidate_cuts: vec![], selected_index: None, selection_method: method },
        )
    };

    // Need enough content for two windows plus the system message.
    if messages.len() < window_size * 2 + 1 {
        tracing::info!(messages = messages.len(), "too few messages for drift detection");
        return Ok(fallback("too_few_messages"));
    }

    let content_messages = &messages[1..];
    let candidate_cuts = drift_candidates(embeddings, content_messages, cfg).await?;

    if let Some(best) = candidate_cuts
        .iter()
        .max_by(|a, b| a.drop.partial_cmp(&b.drop).unwrap_or(std::cmp::Ordering::Equal))
    {
        let cut_index = best.index;
        tracing::info!(cut_index, drop = best.drop, "topic drift boundary selected");
        let mut out = vec![messages[0].clone()];
        out.extend_from_slice(&content_messages[cut_index..]);
        let analysis = DriftAnalysis {
            selected_index: Some(cut_index),
            candidate_cuts,
            selection_method: "largest_drop",
        };
        return Ok((out, analysis));
    }

    tracing::info!(
        prune = cfg.overflow_fallback_prune_count,
        "no topic drift found, oldest-first fallback"
    );
    let (out, mut analysis) = fallback("fallback");
    analysis.candidate_cuts = candidate_cuts;
    Ok((out, analysis))
}

/// Tier-3 pruning: drop the oldest content messages.
pub fn prune_oldest_first(messages: &[ApiMessage], cfg: &ContextConfig) -> Vec<ApiMessage> {
    let keep_from = (cfg.overflow_fallback_prune_count + 1).min(messages.len());
    let mut out = vec![messages[0].clone()];
    out.extend_from_slice(&messages[keep_from..]);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Async LLM judgment (tier-2 follow-up)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn preview(m: &ApiMessage) -> String {
    let text: String = m.content.extract_all_text().chars().take(JUDGMENT_PREVIEW_CHARS).collect();
    format!("  [{}]: {text}...", m.role.as_str())
}

fn build_judgment_prompt(content_messages: &[ApiMessage], candidates: &[DriftCut]) -> String {
    let mut boundary_contexts = Vec::new();
    for (i, cut) in candidates.iter().take(MAX_JUDGMENT_CANDIDATES).enumerate() {
        let before_start = cut.index.saturating_sub(2);
        let after_end = (cut.index + 2).min(content_messages.len());
        let before: Vec<String> =
            content_messages[before_start..cut.index].iter().map(preview).collect();
        let after: Vec<String> =
            content_messages[cut.index..after_end].iter().map(preview).collect();
        boundary_contexts.push(format!(
            "BOUNDARY {} (similarity drop: {:.2}):\nBefore boundary:\n{}\n--- CUT HERE \
             (drop {} messages) ---\nAfter boundary:\n{}",
            i + 1,
            cut.drop,
            before.join("\n"),
            cut.index,
            after.join("\n"),
        ));
    }

    let recent = content_messages
        .last()
        .map(|m| m.content.extract_all_text().chars().take(300).collect::<String>())
        .unwrap_or_default();

    format!(
        "You are helping manage conversation context. The conversation has grown too large \
         and we need to trim older messages.\n\nMOST RECENT MESSAGE (what we're trying to \
         respond to):\n{recent}\n\nCANDIDATE BOUNDARIES:\n{}\n\nWhich boundary is the BEST \
         place to cut? Preserve context that helps answer the recent message.\n\nRespond \
         with ONLY the boundary number (1-{}) or \"NONE\" if no cut is recommended.",
        boundary_contexts.join("\n\n"),
        candidates.len().min(MAX_JUDGMENT_CANDIDATES),
    )
}

fn parse_judgment(text: &str, candidates: &[DriftCut]) -> Option<usize> {
    let cleaned = text.trim().to_uppercase();
    if cleaned == "NONE" {
        return None;
    }
    let number: usize = cleaned.replace("BOUNDARY", "").trim().parse().ok()?;
    if number >= 1 && number <= candidates.len().min(MAX_JUDGMENT_CANDIDATES) {
        return Some(candidates[number - 1].index);
    }
    None
}

/// Fire the cut-point judgment in the background; the chosen index lands in
/// `pending` for one-shot application on the next request. Errors are
/// logged, never surfaced.
pub fn schedule_async_judgment(
    llm: Arc<dyn LlmClient>,
    utility_model: String,
    continuum_id: Uuid,
    messages: Vec<ApiMessage>,
    candidates: Vec<DriftCut>,
    pending: PendingTrims,
) {
    if candidates.is_empty() || messages.len() < 2 {
        return;
    }
    tokio::spawn(async move {
        let content_messages = &messages[1..];
        let prompt = build_judgment_prompt(content_messages, &candidates);
        let req = GenerateRequest {
            messages: vec![ApiMessage::user(prompt)],
            model_override: Some(utility_model),
            thinking_enabled: Some(false),
            temperature: Some(0.0),
            ..Default::default()
        };
        match llm.generate_response(req, None).await {
            Ok(response) => {
                let choice = parse_judgment(&response.text(), &candidates)
                    // Unparseable output falls back to the largest drop.
                    .or_else(|| {
                        candidates
                            .iter()
                            .max_by(|a, b| {
                                a.drop
                                    .partial_cmp(&b.drop)
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            })
                            .map(|c| c.index)
                    });
                if let Some(index) = choice {
                    tracing::info!(%continuum_id, index, "async trim judgment stored");
                    pending.lock().insert(continuum_id, index);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "async context judgment failed (non-critical)");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Deterministic token-bag embedding: similar texts land close.
    fn stub_vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 768];
        for token in text.to_lowercase().split_whitespace() {
            let mut h: u32 = 2166136261;
            for b in token.bytes() {
                h = (h ^ b as u32).wrapping_mul(16777619);
            }
            v[h as usize % 768] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        v.iter().map(|x| x / norm).collect()
    }

    struct StubEmbed;

    #[async_trait]
    impl Embeddings for StubEmbed {
        async fn encode_realtime(&self, text: &str) -> Result<Vec<f32>> {
            Ok(stub_vector(text))
        }
        async fn encode_deep(&self, text: &str) -> Result<Vec<f32>> {
            Ok(stub_vector(text))
        }
    }

    fn msg(role: &str, text: &str) -> ApiMessage {
        match role {
            "system" => ApiMessage::system(text),
            "assistant" => ApiMessage::assistant(text),
            _ => ApiMessage::user(text),
        }
    }

    fn cfg() -> ContextConfig {
        ContextConfig {
            topic_drift_window_size: 2,
            topic_drift_threshold: 0.8,
            overflow_fallback_prune_count: 4,
            max_overflow_retries: 3,
        }
    }

    #[test]
    fn estimate_uses_actual_tokens_when_known() {
        let messages = vec![msg("user", "hello")];
        let est = estimate_request_tokens(&messages, &[], Some(100_000));
        assert_eq!(est, 105_000);
    }

    #[test]
    fn estimate_falls_back_to_chars() {
        let messages = vec![msg("user", &"x".repeat(4000))];
        let est = estimate_request_tokens(&messages, &[], None);
        assert_eq!(est, 1050);
    }

    #[test]
    fn estimate_adds_tool_overhead() {
        let tools = vec![serde_json::json!({"name": "a"}), serde_json::json!({"name": "b"})];
        let est = estimate_request_tokens(&[msg("user", "hi")], &tools, Some(1000));
        assert_eq!(est, ((1000u64 + 200) as f64 * 1.05) as u64);
    }

    #[tokio::test]
    async fn drift_cut_at_topic_shift() {
        // Two clearly different topics; the shift is in the middle.
        let mut messages = vec![msg("system", "system prompt")];
        for _ in 0..4 {
            messages.push(msg("user", "tell me about rust lifetimes borrow checker traits"));
            messages.push(msg("assistant", "rust lifetimes borrow checker traits explained"));
        }
        for _ in 0..4 {
            messages.push(msg("user", "plan grandma birthday cake party balloons"));
            messages.push(msg("assistant", "birthday cake party balloons grandma plan"));
        }

        let (pruned, analysis) = prune_by_topic_drift(&StubEmbed, &messages, &cfg())
            .await
            .unwrap();
        assert_eq!(analysis.selection_method, "largest_drop");
        assert!(analysis.selected_index.is_some());
        // System message preserved, list strictly shorter.
        assert_eq!(pruned[0].content.extract_all_text(), "system prompt");
        assert!(pruned.len() < messages.len());
        // The most recent messages always survive the cut.
        let last = pruned.last().unwrap().content.extract_all_text();
        assert!(last.contains("birthday"));
    }

    #[tokio::test]
    async fn too_few_messages_uses_fallback() {
        let messages = vec![msg("system", "sys"), msg("user", "short")];
        let (pruned, analysis) = prune_by_topic_drift(&StubEmbed, &messages, &cfg())
            .await
            .unwrap();
        assert_eq!(analysis.selection_method, "too_few_messages");
        assert_eq!(pruned[0].content.extract_all_text(), "sys");
    }

    #[test]
    fn oldest_first_preserves_system() {
        let mut messages = vec![msg("system", "sys")];
        for i in 0..10 {
            messages.push(msg("user", &format!("m{i}")));
        }
        let pruned = prune_oldest_first(&messages, &cfg());
        assert_eq!(pruned.len(), messages.len() - 4);
        assert_eq!(pruned[0].content.extract_all_text(), "sys");
        assert_eq!(pruned[1].content.extract_all_text(), "m4");
    }

    #[test]
    fn judgment_parsing() {
        let cuts = vec![
            DriftCut { index: 3, similarity: 0.5, drop: 0.5 },
            DriftCut { index: 7, similarity: 0.6, drop: 0.4 },
        ];
        assert_eq!(parse_judgment("2", &cuts), Some(7));
        assert_eq!(parse_judgment("BOUNDARY 1", &cuts), Some(3));
        assert_eq!(parse_judgment("NONE", &cuts), None);
        assert_eq!(parse_judgment("9", &cuts), None);
        assert_eq!(parse_judgment("gibberish", &cuts), None);
    }
}
