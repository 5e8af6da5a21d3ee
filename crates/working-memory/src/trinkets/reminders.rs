//! Active reminders for the notification center, with a small in-process
//! store manipulated through the actions API.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use mira_domain::{Error, Result};

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ReminderStore {
    reminders: RwLock<HashMap<Uuid, Reminder>>,
}

impl ReminderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user_id: Uuid, text: &str, due_at: DateTime<Utc>) -> Reminder {
        let reminder = Reminder { id: Uuid::new_v4(), user_id, text: text.into(), due_at };
        self.reminders.write().insert(reminder.id, reminder.clone());
        reminder
    }

    pub fn remove(&self, id: &Uuid) -> Result<()> {
        self.reminders
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("reminder {id}")))
    }

    /// A user's reminders, soonest first.
    pub fn for_user(&self, user_id: &Uuid) -> Vec<Reminder> {
        let mut list: Vec<Reminder> = self
            .reminders
            .read()
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.due_at);
        list
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trinket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReminderManager {
    store: Arc<ReminderStore>,
}

impl ReminderManager {
    pub fn new(store: Arc<ReminderStore>) -> Self {
        Self { store }
    }
}

impl Trinket for ReminderManager {
    fn name(&self) -> &'static str {
        "ReminderManager"
    }

    fn variable_name(&self) -> &'static str {
        "active_reminders"
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        let reminders = self.store.for_user(&context.user.user_id);
        if reminders.is_empty() {
            return Ok(String::new());
        }

        let now = Utc::now();
        let horizon = now + Duration::days(7);
        let mut lines = vec!["<active_reminders>".to_string()];
        for reminder in reminders {
            let due = if reminder.due_at < now {
                "overdue"
            } else if reminder.due_at.date_naive() == now.date_naive() {
                "today"
            } else if reminder.due_at <= horizon {
                "upcoming"
            } else {
                continue; // beyond the display horizon
            };
            lines.push(format!(
                "<reminder id=\"{}\" due=\"{}\" at=\"{}\">{}</reminder>",
                reminder.id,
                due,
                reminder.due_at.format("%Y-%m-%d %H:%M UTC"),
                reminder.text
            ));
        }
        if lines.len() == 1 {
            return Ok(String::new());
        }
        lines.push("</active_reminders>".into());
        Ok(lines.join("\n"))
    }
}
