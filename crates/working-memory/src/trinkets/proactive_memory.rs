//! Surfaced long-term memories, formatted as XML for the notification
//! center. Caches the list between updates so the orchestrator can
//! evaluate retention of the previous turn's memories.

use chrono::Utc;
use parking_lot::Mutex;

use mira_domain::tags::format_memory_id;
use mira_domain::Result;
use mira_memory::{LinkedMemory, MemoryRecord};

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

/// Levels of linked memories shown below a primary memory. Traversal depth
/// (retrieval) is deeper; display is capped to keep the context lean.
const MAX_DISPLAY_DEPTH: usize = 2;

#[derive(Default)]
pub struct ProactiveMemoryTrinket {
    cached: Mutex<Vec<MemoryRecord>>,
}

impl ProactiveMemoryTrinket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memories shown on the previous turn, for retention evaluation.
    pub fn cached_memories(&self) -> Vec<MemoryRecord> {
        self.cached.lock().clone()
    }

    /// Replace the cache (evacuation, overflow remediation).
    pub fn set_cached_memories(&self, memories: Vec<MemoryRecord>) {
        *self.cached.lock() = memories;
    }
}

impl Trinket for ProactiveMemoryTrinket {
    fn name(&self) -> &'static str {
        "ProactiveMemoryTrinket"
    }

    fn variable_name(&self) -> &'static str {
        "relevant_memories"
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        if let Some(memories) = &context.memories {
            *self.cached.lock() = memories.clone();
        }
        let memories = self.cached.lock().clone();
        if memories.is_empty() {
            return Ok(String::new());
        }

        let mut parts = vec!["<surfaced_memories>".to_string()];
        for memory in &memories {
            parts.push(format_primary_memory(memory));
        }
        parts.push("</surfaced_memories>".into());
        Ok(parts.join("\n"))
    }
}

fn format_primary_memory(memory: &MemoryRecord) -> String {
    let mut attrs = vec![format!("id=\"{}\"", format_memory_id(&memory.id))];
    if let Some(confidence) = memory.confidence {
        if confidence > 0.75 {
            attrs.push(format!("confidence=\"{}\"", (confidence * 100.0) as u32));
        }
    }

    let mut parts = vec![format!("<memory {}>", attrs.join(" "))];
    parts.push(format!("<text>{}</text>", memory.text));
    parts.push(format!("<created>{}</created>", relative_time(memory.created_at)));

    let mut temporal = Vec::new();
    if let Some(expires) = memory.expires_at {
        temporal.push(format!("expires=\"{}\"", expires.format("%Y-%m-%d")));
    }
    if let Some(happens) = memory.happens_at {
        temporal.push(format!("happens=\"{}\"", happens.format("%Y-%m-%d")));
    }
    if !temporal.is_empty() {
        parts.push(format!("<temporal {}/>", temporal.join(" ")));
    }

    if !memory.linked_memories.is_empty() {
        parts.push(format_linked(&memory.linked_memories, 1));
    }

    parts.push("</memory>".into());
    parts.join("\n")
}

fn format_linked(links: &[LinkedMemory], depth: usize) -> String {
    if depth > MAX_DISPLAY_DEPTH || links.is_empty() {
        return String::new();
    }

    let mut parts = vec!["<linked_memories>".to_string()];
    for link in links {
        let mut attrs = vec![
            format!("id=\"{}\"", format_memory_id(&link.id)),
            format!("link_type=\"{}\"", link.link_metadata.link_type),
        ];
        if let Some(confidence) = link.link_metadata.confidence {
            if confidence > 0.75 {
                attrs.push(format!("confidence=\"{}\"", (confidence * 100.0) as u32));
            }
        }
        parts.push(format!("<linked_memory {}>", attrs.join(" ")));
        parts.push(format!("<text>{}</text>", link.text));
        if !link.linked_memories.is_empty() {
            let nested = format_linked(&link.linked_memories, depth + 1);
            if !nested.is_empty() {
                parts.push(nested);
            }
        }
        parts.push("</linked_memory>".into());
    }
    parts.push("</linked_memories>".into());
    parts.join("\n")
}

fn relative_time(at: chrono::DateTime<Utc>) -> String {
    let delta = Utc::now() - at;
    if delta.num_days() > 30 {
        format!("{} months ago", (delta.num_days() / 30).max(1))
    } else if delta.num_days() >= 1 {
        format!("{} days ago", delta.num_days())
    } else if delta.num_hours() >= 1 {
        format!("{} hours ago", delta.num_hours())
    } else {
        "just now".into()
    }
}
