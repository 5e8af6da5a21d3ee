//! Event-driven working memory coordinator.
//!
//! Owns the trinket registry and the composer, wired together purely over
//! the bus: a compose request fans out synchronous update events to every
//! trinket, their content events populate the composer, and the composed
//! three-zone prompt is published back.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use mira_domain::{Error, Result};
use mira_kv::{KvStore, KEY_TRINKETS};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::composer::{ComposedPrompt, PromptComposer};
use crate::events::{ContinuumEvent, TrinketContext};
use crate::trinkets::{placement_of, Trinket};

pub struct WorkingMemory {
    bus: Arc<EventBus>,
    composer: Mutex<PromptComposer>,
    trinkets: RwLock<HashMap<&'static str, Arc<dyn Trinket>>>,
    kv: Arc<KvStore>,
    /// Most recent composed prompt, captured from the composed event so
    /// synchronous callers can read it back after publishing a compose.
    last_composed: Mutex<Option<ComposedPrompt>>,
}

impl WorkingMemory {
    /// Build and subscribe. The returned handle is shared with the
    /// gateway for trinket registration and state inspection.
    pub fn new(bus: Arc<EventBus>, kv: Arc<KvStore>) -> Arc<Self> {
        let wm = Arc::new(Self {
            bus: Arc::clone(&bus),
            composer: Mutex::new(PromptComposer::new()),
            trinkets: RwLock::new(HashMap::new()),
            kv,
            last_composed: Mutex::new(None),
        });

        {
            let wm = Arc::clone(&wm);
            bus.subscribe("ComposeSystemPromptEvent", move |event| {
                wm.handle_compose(event)
            });
        }
        {
            let wm = Arc::clone(&wm);
            bus.subscribe("UpdateTrinketEvent", move |event| wm.handle_update(event));
        }
        {
            let wm = Arc::clone(&wm);
            bus.subscribe("TrinketContentEvent", move |event| wm.handle_content(event));
        }
        {
            let wm = Arc::clone(&wm);
            bus.subscribe("SystemPromptComposedEvent", move |event| {
                if let ContinuumEvent::SystemPromptComposed {
                    cached_content,
                    non_cached_content,
                    notification_center,
                    ..
                } = event
                {
                    *wm.last_composed.lock() = Some(ComposedPrompt {
                        cached_content: cached_content.clone(),
                        non_cached_content: non_cached_content.clone(),
                        notification_center: notification_center.clone(),
                    });
                }
                Ok(())
            });
        }

        tracing::info!("working memory initialized");
        wm
    }

    pub fn register_trinket(&self, trinket: Arc<dyn Trinket>) {
        tracing::info!(trinket = trinket.name(), "registered trinket");
        self.trinkets.write().insert(trinket.name(), trinket);
    }

    pub fn trinket_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.trinkets.read().keys().copied().collect();
        names.sort();
        names
    }

    // ── Event handlers ─────────────────────────────────────────────

    fn handle_compose(&self, event: &ContinuumEvent) -> Result<()> {
        let ContinuumEvent::ComposeSystemPrompt { continuum_id, base_prompt, user } = event
        else {
            return Ok(());
        };

        // Personalize: the base prompt addresses "The User" until a first
        // name is known.
        let name = user
            .first_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("The User");
        let personalized = base_prompt.replace("The User", name);

        {
            let mut composer = self.composer.lock();
            composer.set_base_prompt(&personalized);
            composer.clear_sections(true);
        }

        // Fan out updates; handlers run inline, so the composer is fully
        // populated when the loop returns.
        let names = self.trinket_names();
        for trinket_name in names {
            self.bus.publish(&ContinuumEvent::UpdateTrinket {
                continuum_id: *continuum_id,
                target_trinket: trinket_name.to_string(),
                context: TrinketContext { user: user.clone(), ..Default::default() },
            });
        }

        let composed = self.composer.lock().compose();
        tracing::info!(
            cached = composed.cached_content.len(),
            non_cached = composed.non_cached_content.len(),
            notification = composed.notification_center.len(),
            "composed system prompt"
        );
        self.bus.publish(&ContinuumEvent::SystemPromptComposed {
            continuum_id: *continuum_id,
            cached_content: composed.cached_content,
            non_cached_content: composed.non_cached_content,
            notification_center: composed.notification_center,
        });
        Ok(())
    }

    fn handle_update(&self, event: &ContinuumEvent) -> Result<()> {
        let ContinuumEvent::UpdateTrinket { continuum_id, target_trinket, context } = event
        else {
            return Ok(());
        };

        let Some(trinket) = self.trinkets.read().get(target_trinket.as_str()).cloned() else {
            tracing::warn!(trinket = %target_trinket, "no trinket registered with that name");
            return Ok(());
        };

        let content = trinket.generate_content(context)?;
        if content.trim().is_empty() {
            return Ok(());
        }

        self.persist_section(
            &context.user.user_id,
            trinket.variable_name(),
            &content,
            trinket.cache_policy(),
        );

        self.bus.publish(&ContinuumEvent::TrinketContent {
            continuum_id: *continuum_id,
            variable_name: trinket.variable_name().to_string(),
            content,
            trinket_name: trinket.name().to_string(),
            cache_policy: trinket.cache_policy(),
            placement: placement_of(trinket.name()),
        });
        Ok(())
    }

    fn handle_content(&self, event: &ContinuumEvent) -> Result<()> {
        let ContinuumEvent::TrinketContent {
            variable_name, content, cache_policy, placement, ..
        } = event
        else {
            return Ok(());
        };
        self.composer
            .lock()
            .add_section(variable_name, content, *cache_policy, *placement);
        Ok(())
    }

    // ── KV mirror (out-of-band inspection) ─────────────────────────

    fn persist_section(&self, user_id: &Uuid, section: &str, content: &str, cache_policy: bool) {
        let value = serde_json::json!({
            "content": content,
            "cache_policy": cache_policy,
            "updated_at": chrono::Utc::now().to_rfc3339(),
        });
        self.kv.hset(
            &format!("{KEY_TRINKETS}{user_id}"),
            section,
            &value.to_string(),
        );
    }

    /// Cached state of one trinket section from the KV mirror.
    pub fn trinket_state(&self, user_id: &Uuid, section: &str) -> Result<Option<serde_json::Value>> {
        let Some(raw) = self.kv.hget(&format!("{KEY_TRINKETS}{user_id}"), section) else {
            return Ok(None);
        };
        let data: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| Error::Infrastructure(format!("corrupt trinket cache: {e}")))?;
        Ok(Some(serde_json::json!({
            "section_name": section,
            "content": data.get("content").cloned().unwrap_or_default(),
            "cache_policy": data.get("cache_policy").cloned().unwrap_or_default(),
            "last_updated": data.get("updated_at").cloned().unwrap_or_default(),
        })))
    }

    /// Cached state of all sections for a user.
    pub fn all_trinket_states(&self, user_id: &Uuid) -> Vec<serde_json::Value> {
        let sections = self.kv.hgetall(&format!("{KEY_TRINKETS}{user_id}"));
        let mut names: Vec<&String> = sections.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.trinket_state(user_id, name).ok().flatten())
            .collect()
    }

    /// Compose synchronously and return the result. Events are
    /// synchronous, so the composed prompt is captured by the time the
    /// publish returns.
    pub fn compose_now(
        &self,
        continuum_id: Uuid,
        base_prompt: &str,
        user: &mira_domain::message::UserContext,
    ) -> ComposedPrompt {
        *self.last_composed.lock() = None;
        self.bus.publish(&ContinuumEvent::ComposeSystemPrompt {
            continuum_id,
            base_prompt: base_prompt.to_string(),
            user: user.clone(),
        });
        self.last_composed.lock().take().unwrap_or_default()
    }
}
