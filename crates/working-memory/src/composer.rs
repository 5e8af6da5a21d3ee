//! System prompt composer.
//!
//! Collects named sections from trinkets and assembles them into three
//! zones: cached system content, non-cached system content, and the
//! notification center (the sliding assistant message). Section order is
//! fixed by configuration; placement and cache policy route each section
//! into exactly one zone.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::events::Placement;

/// Display order for all known sections.
pub const SECTION_ORDER: &[&str] = &[
    // System prompt sections
    "base_prompt",
    "domaindoc",
    "tool_guidance",
    "tool_hints",
    // Notification center sections
    "datetime_section",
    "conversation_manifest",
    "active_reminders",
    "context_search_results",
    "relevant_memories",
];

const SECTION_SEPARATOR: &str = "\n\n---\n\n";
const DELIMITER: &str =
    "════════════════════════════════════════════════════════════";

#[derive(Debug, Clone)]
struct SectionData {
    content: String,
    cache_policy: bool,
    placement: Placement,
}

/// The three composed zones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposedPrompt {
    pub cached_content: String,
    pub non_cached_content: String,
    pub notification_center: String,
}

#[derive(Default)]
pub struct PromptComposer {
    sections: HashMap<String, SectionData>,
}

fn excess_newlines() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

impl PromptComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base system prompt, wrapped with a delimiter and a
    /// scaffolding note so the model can tell instructions from injected
    /// context.
    pub fn set_base_prompt(&mut self, prompt: &str) {
        let note = "Everything after this delimiter is part of MIRA's scaffolding, \
                    injected to provide additional context during the reply.";
        let delimited = format!("{prompt}\n\n{DELIMITER}\n{note}\n{DELIMITER}");
        self.sections.insert(
            "base_prompt".into(),
            SectionData {
                content: delimited,
                cache_policy: true,
                placement: Placement::System,
            },
        );
    }

    /// Add or update a section. Empty content is ignored.
    pub fn add_section(
        &mut self,
        name: &str,
        content: &str,
        cache_policy: bool,
        placement: Placement,
    ) {
        if content.trim().is_empty() {
            tracing::debug!(section = name, "skipping empty section");
            return;
        }
        self.sections.insert(
            name.to_string(),
            SectionData { content: content.to_string(), cache_policy, placement },
        );
    }

    /// Clear all sections, optionally keeping the base prompt.
    pub fn clear_sections(&mut self, preserve_base: bool) {
        let base = preserve_base
            .then(|| self.sections.get("base_prompt").cloned())
            .flatten();
        self.sections.clear();
        if let Some(base) = base {
            self.sections.insert("base_prompt".into(), base);
        }
    }

    /// Compose the three zones, walking the configured order.
    pub fn compose(&self) -> ComposedPrompt {
        if self.sections.is_empty() {
            tracing::warn!("no sections to compose - missing base prompt");
            return ComposedPrompt::default();
        }

        let mut cached_parts: Vec<&str> = Vec::new();
        let mut non_cached_parts: Vec<&str> = Vec::new();
        let mut notification_parts: Vec<&str> = Vec::new();

        for name in SECTION_ORDER {
            let Some(section) = self.sections.get(*name) else {
                continue;
            };
            if section.content.trim().is_empty() {
                continue;
            }
            match (section.placement, section.cache_policy) {
                (Placement::Notification, _) => notification_parts.push(&section.content),
                (Placement::System, true) => cached_parts.push(&section.content),
                (Placement::System, false) => non_cached_parts.push(&section.content),
            }
        }

        ComposedPrompt {
            cached_content: clean(&cached_parts.join(SECTION_SEPARATOR)),
            non_cached_content: clean(&non_cached_parts.join(SECTION_SEPARATOR)),
            notification_center: build_notification_center(&notification_parts),
        }
    }
}

/// The notification center carries a fixed header and a trailing delimiter;
/// the opening HUD delimiter is supplied by the orchestrator's assistant
/// message.
fn build_notification_center(parts: &[&str]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let mut lines: Vec<&str> = vec![
        "Runtime state. Authoritative for current context.",
        "Provides: temporal orientation, conversation structure, pending tasks, relevant memories.",
        "",
    ];
    for content in parts {
        lines.push(content);
        lines.push("");
    }
    lines.push(DELIMITER);
    lines.join("\n")
}

/// Collapse 3+ newlines to exactly 2 and trim.
fn clean(content: &str) -> String {
    excess_newlines().replace_all(content, "\n\n").trim().to_string()
}
