//! Working memory: the event bus, trinkets, and prompt composition.

pub mod bus;
pub mod composer;
pub mod core;
pub mod events;
pub mod trinkets;

pub use bus::EventBus;
pub use composer::{ComposedPrompt, PromptComposer, SECTION_ORDER};
pub use core::WorkingMemory;
pub use events::{ContinuumEvent, Placement, TrinketContext};
pub use trinkets::domaindoc::{DomainDoc, DomainDocStore, DomainDocTrinket};
pub use trinkets::manifest::ManifestTrinket;
pub use trinkets::proactive_memory::ProactiveMemoryTrinket;
pub use trinkets::reminders::{Reminder, ReminderManager, ReminderStore};
pub use trinkets::time::TimeManager;
pub use trinkets::tool_guidance::ToolGuidanceTrinket;
pub use trinkets::Trinket;
