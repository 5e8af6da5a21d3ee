//! Segment lifecycle: boundary sentinels, collapse-to-summary, postpone
//! stacking, and manifest queries.
//!
//! A sentinel is a synthetic assistant message with segment metadata. At
//! most one sentinel per user is `active`; collapse marks it `collapsed`
//! (with title, summary, and a summary embedding) and immediately creates
//! a fresh active sentinel for the next segment.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use mira_domain::message::{
    ApiMessage, Message, MessageMetadata, SegmentMeta, SegmentStatus,
};
use mira_domain::{Error, Result};
use mira_memory::Embeddings;
use mira_providers::{GenerateRequest, LlmClient};

use crate::continuum::Continuum;

/// Placeholder content carried by sentinel messages; never sent to the LLM.
pub const SENTINEL_PLACEHOLDER: &str = "[segment boundary]";

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub segment_id: Uuid,
    pub status: SegmentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub display_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollapseOutcome {
    pub segment_id: Uuid,
    pub display_title: String,
    pub summary: String,
}

pub struct SegmentService {
    llm: Arc<dyn LlmClient>,
    embeddings: Arc<dyn Embeddings>,
    utility_model: String,
    timeout_minutes: i64,
}

impl SegmentService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        embeddings: Arc<dyn Embeddings>,
        utility_model: String,
        timeout_minutes: i64,
    ) -> Self {
        Self { llm, embeddings, utility_model, timeout_minutes }
    }

    fn new_sentinel() -> Message {
        Message::assistant(SENTINEL_PLACEHOLDER).with_metadata(MessageMetadata {
            segment: Some(SegmentMeta {
                is_segment_boundary: true,
                status: SegmentStatus::Active,
                segment_id: Uuid::new_v4(),
                segment_start_time: Utc::now(),
                segment_end_time: None,
                display_title: None,
                summary: None,
                tools_used: vec![],
                segment_embedding_value: None,
                virtual_last_message_time: None,
            }),
            ..Default::default()
        })
    }

    fn active_sentinel_index(continuum: &Continuum) -> Option<usize> {
        continuum
            .messages
            .iter()
            .rposition(|m| m.metadata.is_active_sentinel())
    }

    /// Create the active sentinel if the continuum has none (onboarding,
    /// or recovery after a missed collapse step).
    pub fn ensure_active_sentinel(&self, continuum: &mut Continuum) {
        if Self::active_sentinel_index(continuum).is_none() {
            continuum.messages.push(Self::new_sentinel());
            tracing::info!(continuum_id = %continuum.id, "created active segment sentinel");
        }
    }

    /// Postpone collapse by `minutes`. Postpones stack: when the virtual
    /// time is still in the future, minutes are added to it; otherwise to
    /// now. Returns the new virtual last-message time.
    pub fn postpone(&self, continuum: &mut Continuum, minutes: i64) -> Result<DateTime<Utc>> {
        let idx = Self::active_sentinel_index(continuum)
            .ok_or_else(|| Error::NotFound("no active segment".into()))?;
        let now = Utc::now();
        let meta = continuum.messages[idx].metadata.segment.as_mut().unwrap();
        let base = match meta.virtual_last_message_time {
            Some(v) if v > now => v,
            _ => now,
        };
        let new_time = base + Duration::minutes(minutes);
        meta.virtual_last_message_time = Some(new_time);
        tracing::info!(
            continuum_id = %continuum.id,
            until = %new_time,
            "segment collapse postponed"
        );
        Ok(new_time)
    }

    /// Whether the active segment is due for collapse at `now`: no new
    /// messages for `segment_timeout` minutes relative to the virtual
    /// last-message time, and the segment is non-empty.
    pub fn collapse_due(&self, continuum: &Continuum, now: DateTime<Utc>) -> bool {
        let Some(idx) = Self::active_sentinel_index(continuum) else {
            return false;
        };
        let has_messages = continuum.messages[idx + 1..]
            .iter()
            .any(|m| !m.metadata.is_segment_boundary());
        if !has_messages {
            return false;
        }
        let meta = continuum.messages[idx].metadata.segment.as_ref().unwrap();
        let last = continuum
            .last_message_time()
            .unwrap_or(meta.segment_start_time);
        let effective = match meta.virtual_last_message_time {
            Some(v) if v > last => v,
            _ => last,
        };
        now >= effective + Duration::minutes(self.timeout_minutes)
    }

    /// Collapse the active segment: summarize, embed, mark the sentinel
    /// collapsed, and open a fresh active segment.
    pub async fn collapse(&self, continuum: &mut Continuum) -> Result<CollapseOutcome> {
        let idx = Self::active_sentinel_index(continuum)
            .ok_or_else(|| Error::NotFound("no active segment".into()))?;

        let segment_messages: Vec<&Message> = continuum.messages[idx + 1..]
            .iter()
            .filter(|m| !m.metadata.is_segment_boundary())
            .collect();
        if segment_messages.is_empty() {
            return Err(Error::Validation("cannot collapse an empty segment".into()));
        }

        let summary = self.summarize(&segment_messages).await?;
        let embedding = self.embeddings.encode_deep(&summary.summary).await?;
        let end_time = continuum.last_message_time().unwrap_or_else(Utc::now);

        let segment_id = {
            let meta = continuum.messages[idx].metadata.segment.as_mut().unwrap();
            meta.status = SegmentStatus::Collapsed;
            meta.segment_end_time = Some(end_time);
            meta.display_title = Some(summary.title.clone());
            meta.summary = Some(summary.summary.clone());
            meta.tools_used = summary.tools_used.clone();
            meta.segment_embedding_value = Some(embedding);
            meta.virtual_last_message_time = None;
            meta.segment_id
        };

        // The next segment starts immediately.
        continuum.messages.push(Self::new_sentinel());
        continuum.segment_turn_number = 0;

        tracing::info!(
            continuum_id = %continuum.id,
            segment_id = %segment_id,
            title = %summary.title,
            "segment collapsed"
        );

        Ok(CollapseOutcome {
            segment_id,
            display_title: summary.title,
            summary: summary.summary,
        })
    }

    async fn summarize(&self, messages: &[&Message]) -> Result<SegmentSummary> {
        let mut transcript = String::new();
        for msg in messages {
            let text: String = msg.content.text_for_context().chars().take(600).collect();
            transcript.push_str(&format!("[{}]: {}\n", msg.role.as_str(), text));
        }

        let prompt = format!(
            "Summarize this conversation segment. Respond with ONLY a JSON object:\n\
             {{\"title\": \"3-6 word display title\", \"summary\": \"2-4 sentence summary of \
             what was discussed and decided\", \"tools_used\": [\"names of any tools that \
             were used\"]}}\n\nSEGMENT:\n{transcript}"
        );

        let req = GenerateRequest {
            messages: vec![ApiMessage::user(prompt)],
            model_override: Some(self.utility_model.clone()),
            thinking_enabled: Some(false),
            temperature: Some(0.1),
            ..Default::default()
        };
        let response = self.llm.generate_response(req, None).await?;
        Ok(parse_summary(&response.text()))
    }

    /// Recent segments, oldest first, including the active one.
    pub fn list_segments(continuum: &Continuum, limit: usize) -> Vec<SegmentInfo> {
        let mut segments: Vec<SegmentInfo> = continuum
            .messages
            .iter()
            .filter_map(|m| m.metadata.segment.as_ref())
            .filter(|s| s.is_segment_boundary)
            .map(|s| SegmentInfo {
                segment_id: s.segment_id,
                status: s.status,
                start_time: s.segment_start_time,
                end_time: s.segment_end_time,
                display_title: s.display_title.clone(),
            })
            .collect();
        if segments.len() > limit {
            segments.drain(..segments.len() - limit);
        }
        segments
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentSummary {
    title: String,
    summary: String,
    #[serde(default)]
    tools_used: Vec<String>,
}

/// Parse the summarizer's JSON, tolerating code fences and stray prose.
fn parse_summary(text: &str) -> SegmentSummary {
    let trimmed = text.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
    if let Ok(parsed) = serde_json::from_str::<SegmentSummary>(trimmed) {
        return parsed;
    }
    // Last resort: find the outermost braces.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if let Ok(parsed) = serde_json::from_str::<SegmentSummary>(&trimmed[start..=end]) {
            return parsed;
        }
    }
    tracing::warn!("segment summary was not valid JSON; using raw text");
    let title: String = trimmed.lines().next().unwrap_or("Conversation").chars().take(48).collect();
    SegmentSummary { title, summary: trimmed.to_string(), tools_used: vec![] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mira_domain::message::{ContentBlock, ProviderMessage, StopReason, Usage};
    use mira_domain::stream::StreamEvent;
    use tokio::sync::mpsc;

    struct FixedLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn generate_response(
            &self,
            _req: GenerateRequest,
            _events: Option<mpsc::Sender<StreamEvent>>,
        ) -> Result<ProviderMessage> {
            Ok(ProviderMessage {
                content: vec![ContentBlock::text(self.reply.clone())],
                stop_reason: Some(StopReason::EndTurn),
                usage: Usage::default(),
                container_id: None,
                reasoning_details: None,
            })
        }
    }

    struct FixedEmbeddings;

    #[async_trait]
    impl Embeddings for FixedEmbeddings {
        async fn encode_realtime(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.1; 768])
        }
        async fn encode_deep(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.2; 768])
        }
    }

    fn service(reply: &str) -> SegmentService {
        SegmentService::new(
            Arc::new(FixedLlm { reply: reply.into() }),
            Arc::new(FixedEmbeddings),
            "claude-3-5-haiku-20241022".into(),
            30,
        )
    }

    fn active_count(continuum: &Continuum) -> usize {
        continuum
            .messages
            .iter()
            .filter(|m| m.metadata.is_active_sentinel())
            .count()
    }

    #[test]
    fn ensure_creates_exactly_one_active_sentinel() {
        let svc = service("{}");
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        svc.ensure_active_sentinel(&mut continuum);
        assert_eq!(active_count(&continuum), 1);
    }

    #[tokio::test]
    async fn collapse_marks_old_and_creates_new_active() {
        let svc = service(
            r#"{"title": "Trip planning", "summary": "Planned the Lisbon trip.", "tools_used": ["web_tool"]}"#,
        );
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        continuum.add_user_message("let's plan the trip");
        continuum.add_assistant_message("sure, here's the plan", Default::default());

        let outcome = svc.collapse(&mut continuum).await.unwrap();
        assert_eq!(outcome.display_title, "Trip planning");

        // Exactly one active sentinel remains, and it is the newest one.
        assert_eq!(active_count(&continuum), 1);
        let collapsed: Vec<&SegmentMeta> = continuum
            .messages
            .iter()
            .filter_map(|m| m.metadata.segment.as_ref())
            .filter(|s| s.status == SegmentStatus::Collapsed)
            .collect();
        assert_eq!(collapsed.len(), 1);
        let meta = collapsed[0];
        assert!(meta.summary.as_ref().is_some_and(|s| !s.is_empty()));
        assert!(meta.display_title.is_some());
        assert!(meta.segment_end_time.is_some());
        assert!(meta.segment_embedding_value.as_ref().is_some_and(|e| e.len() == 768));
        assert_eq!(meta.tools_used, vec!["web_tool"]);
        assert_eq!(continuum.segment_turn_number, 0);
    }

    #[tokio::test]
    async fn collapse_empty_segment_rejected() {
        let svc = service("{}");
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        let err = svc.collapse(&mut continuum).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn collapse_due_respects_timeout_and_virtual_time() {
        let svc = service("{}");
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        continuum.add_user_message("hello");

        let now = Utc::now();
        assert!(!svc.collapse_due(&continuum, now));
        assert!(svc.collapse_due(&continuum, now + Duration::minutes(31)));

        // Postponing pushes the due time out.
        svc.postpone(&mut continuum, 60).unwrap();
        assert!(!svc.collapse_due(&continuum, now + Duration::minutes(31)));
        assert!(svc.collapse_due(&continuum, now + Duration::minutes(91)));
    }

    #[test]
    fn postpones_stack_on_future_virtual_time() {
        let svc = service("{}");
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);

        let first = svc.postpone(&mut continuum, 30).unwrap();
        let second = svc.postpone(&mut continuum, 30).unwrap();
        let delta = (second - first).num_minutes();
        assert_eq!(delta, 30);
    }

    #[test]
    fn empty_segment_never_due() {
        let svc = service("{}");
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        assert!(!svc.collapse_due(&continuum, Utc::now() + Duration::hours(10)));
    }

    #[test]
    fn parse_summary_tolerates_fences() {
        let fenced = "```json\n{\"title\": \"T\", \"summary\": \"S\"}\n```";
        let parsed = parse_summary(fenced);
        assert_eq!(parsed.title, "T");
        assert_eq!(parsed.summary, "S");
        assert!(parsed.tools_used.is_empty());
    }

    #[tokio::test]
    async fn list_segments_includes_collapsed_and_active() {
        let svc = service(r#"{"title": "One", "summary": "s"}"#);
        let mut continuum = Continuum::new(Uuid::new_v4());
        svc.ensure_active_sentinel(&mut continuum);
        continuum.add_user_message("a");
        continuum.add_assistant_message("b", Default::default());
        svc.collapse(&mut continuum).await.unwrap();

        let segments = SegmentService::list_segments(&continuum, 10);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].status, SegmentStatus::Collapsed);
        assert_eq!(segments[1].status, SegmentStatus::Active);
    }
}
