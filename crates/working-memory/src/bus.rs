//! Synchronous in-process event bus.
//!
//! Publishing runs every subscriber inline, in subscription order, before
//! returning. A handler that publishes recurses immediately — nothing is
//! queued. Subscriber failures are logged with a category tag and never
//! reach the publisher: trinket failures must not crash prompt composition.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use mira_domain::Result;

use crate::events::ContinuumEvent;

type Handler = Arc<dyn Fn(&ContinuumEvent) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<&'static str, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to an event type name.
    pub fn subscribe<F>(&self, event_type: &'static str, handler: F)
    where
        F: Fn(&ContinuumEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Publish an event. All subscriber invocations complete before this
    /// returns; the caller never sees a subscriber's error or panic.
    pub fn publish(&self, event: &ContinuumEvent) {
        // Snapshot the handler list so handlers can publish (recurse) or
        // subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(event.type_name())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_subscriber_failure(event.type_name(), &e.to_string()),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".into());
                    log_subscriber_failure(event.type_name(), &detail);
                }
            }
        }
    }
}

/// Categorize by message content: infrastructure failures (database, KV,
/// connection) vs logic errors.
fn log_subscriber_failure(event_type: &str, detail: &str) {
    let lower = detail.to_lowercase();
    let infrastructure = ["database", "valkey", "connection", "infrastructure"]
        .iter()
        .any(|kw| lower.contains(kw));
    if infrastructure {
        tracing::error!(
            event = event_type,
            error_category = "infrastructure",
            detail,
            "subscriber failed"
        );
    } else {
        tracing::error!(
            event = event_type,
            error_category = "logic",
            detail,
            "subscriber failed"
        );
    }
}
