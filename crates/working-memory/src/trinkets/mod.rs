//! Trinkets: content contributors for the composed prompt.
//!
//! A trinket responds to an update request by generating one named section.
//! Placement is fixed per trinket via the registry below: the listed
//! trinkets go to the notification center, everything else to the system
//! prompt.

pub mod domaindoc;
pub mod manifest;
pub mod proactive_memory;
pub mod reminders;
pub mod time;
pub mod tool_guidance;

use mira_domain::Result;

use crate::events::{Placement, TrinketContext};

/// Trinkets whose sections go to the notification center.
const NOTIFICATION_CENTER_TRINKETS: &[&str] = &[
    "TimeManager",
    "ManifestTrinket",
    "ReminderManager",
    "GetContextTrinket",
    "ProactiveMemoryTrinket",
];

pub trait Trinket: Send + Sync {
    /// Registry name, used as the `UpdateTrinketEvent` target.
    fn name(&self) -> &'static str;

    /// Section name this trinket publishes.
    fn variable_name(&self) -> &'static str;

    /// Whether the section participates in prompt caching.
    fn cache_policy(&self) -> bool {
        false
    }

    /// Generate the section content. Empty output means no section this
    /// turn. Infrastructure failures propagate; the bus isolates them.
    fn generate_content(&self, context: &TrinketContext) -> Result<String>;
}

/// Placement is determined by the registry, not by the trinket itself.
pub fn placement_of(trinket_name: &str) -> Placement {
    if NOTIFICATION_CENTER_TRINKETS.contains(&trinket_name) {
        Placement::Notification
    } else {
        Placement::System
    }
}
