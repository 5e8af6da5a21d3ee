//! Events flowing through the working-memory bus.
//!
//! The bidirectional flow between trinkets and the working-memory core
//! runs exclusively through these events — neither side holds references
//! into the other beyond registration.

use std::collections::HashMap;
use uuid::Uuid;

use mira_domain::message::UserContext;
use mira_memory::MemoryRecord;

/// Where trinket content lands in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    System,
    Notification,
}

/// Per-turn data handed to trinkets on update.
#[derive(Debug, Clone, Default)]
pub struct TrinketContext {
    pub user: UserContext,
    /// Merged surfaced memories (proactive-memory trinket).
    pub memories: Option<Vec<MemoryRecord>>,
    /// Usage hints from enabled tools (tool-guidance trinket).
    pub tool_hints: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub enum ContinuumEvent {
    /// A message was appended to the continuum.
    MessageAdded {
        continuum_id: Uuid,
        message_id: Uuid,
        role: &'static str,
    },

    /// Ask one trinket to regenerate its section.
    UpdateTrinket {
        continuum_id: Uuid,
        target_trinket: String,
        context: TrinketContext,
    },

    /// A trinket produced content for the composer.
    TrinketContent {
        continuum_id: Uuid,
        variable_name: String,
        content: String,
        trinket_name: String,
        cache_policy: bool,
        placement: Placement,
    },

    /// Ask the working memory to compose the full prompt.
    ComposeSystemPrompt {
        continuum_id: Uuid,
        base_prompt: String,
        user: UserContext,
    },

    /// The composed three-zone prompt.
    SystemPromptComposed {
        continuum_id: Uuid,
        cached_content: String,
        non_cached_content: String,
        notification_center: String,
    },

    /// A turn finished: the assistant message is in the in-memory
    /// continuum, the unit of work has not yet committed.
    TurnCompleted {
        continuum_id: Uuid,
        turn_number: usize,
        segment_turn_number: u32,
    },
}

impl ContinuumEvent {
    /// Dispatch key. Handlers subscribe by this name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ContinuumEvent::MessageAdded { .. } => "MessageAdded",
            ContinuumEvent::UpdateTrinket { .. } => "UpdateTrinketEvent",
            ContinuumEvent::TrinketContent { .. } => "TrinketContentEvent",
            ContinuumEvent::ComposeSystemPrompt { .. } => "ComposeSystemPromptEvent",
            ContinuumEvent::SystemPromptComposed { .. } => "SystemPromptComposedEvent",
            ContinuumEvent::TurnCompleted { .. } => "TurnCompletedEvent",
        }
    }
}
