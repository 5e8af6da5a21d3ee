//! The continuum: an append-only conversation for one user.
//!
//! Mutation goes exclusively through `add_user_message` /
//! `add_assistant_message`, each returning the new message plus domain
//! events for the caller to publish. Durability is the repository's job —
//! the in-memory continuum is authoritative during a turn and only becomes
//! durable when the unit of work commits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use mira_domain::message::{ApiMessage, Message, MessageContent, MessageMetadata};
use mira_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Domain events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events produced by continuum mutations, for the caller to publish.
#[derive(Debug, Clone)]
pub enum ContinuumDelta {
    UserMessageAdded { continuum_id: Uuid, message_id: Uuid },
    AssistantMessageAdded { continuum_id: Uuid, message_id: Uuid },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Continuum
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuum {
    pub id: Uuid,
    pub user_id: Uuid,
    pub messages: Vec<Message>,
    /// Turn number within the current segment, incremented at the API
    /// boundary for real user messages only; reset on collapse.
    #[serde(default)]
    pub segment_turn_number: u32,
}

impl Continuum {
    pub fn new(user_id: Uuid) -> Self {
        Self { id: Uuid::new_v4(), user_id, messages: Vec::new(), segment_turn_number: 0 }
    }

    pub fn add_user_message(
        &mut self,
        content: impl Into<MessageContent>,
    ) -> (Message, Vec<ContinuumDelta>) {
        let message = Message::user(content);
        self.messages.push(message.clone());
        let events = vec![ContinuumDelta::UserMessageAdded {
            continuum_id: self.id,
            message_id: message.id,
        }];
        (message, events)
    }

    pub fn add_assistant_message(
        &mut self,
        content: impl Into<MessageContent>,
        metadata: MessageMetadata,
    ) -> (Message, Vec<ContinuumDelta>) {
        let message = Message::assistant(content).with_metadata(metadata);
        self.messages.push(message.clone());
        let events = vec![ContinuumDelta::AssistantMessageAdded {
            continuum_id: self.id,
            message_id: message.id,
        }];
        (message, events)
    }

    /// Total conversation turns (user + assistant message pairs).
    pub fn turn_number(&self) -> usize {
        (self.messages.len() + 1) / 2
    }

    /// Index of the most recent segment sentinel, if any.
    pub fn last_sentinel_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.metadata.is_segment_boundary())
    }

    /// Messages in the current segment (after the last sentinel), with
    /// sentinel placeholders excluded. This is what the LLM sees.
    pub fn messages_for_api(&self) -> Vec<ApiMessage> {
        let start = self.last_sentinel_index().map(|i| i + 1).unwrap_or(0);
        self.messages[start..]
            .iter()
            .filter(|m| !m.metadata.is_segment_boundary())
            .map(|m| ApiMessage::new(m.role, m.content.clone()))
            .collect()
    }

    /// Time of the last non-sentinel message, used for collapse scheduling.
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .rev()
            .find(|m| !m.metadata.is_segment_boundary())
            .map(|m| m.created_at)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-user continuum repository backed by JSON snapshots in the state
/// directory. The in-process cache is the working copy; disk is written
/// only through [`crate::uow::UnitOfWork::commit`].
pub struct ContinuumRepository {
    state_dir: PathBuf,
    cache: Mutex<HashMap<Uuid, Continuum>>,
}

impl ContinuumRepository {
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self { state_dir, cache: Mutex::new(HashMap::new()) })
    }

    fn path_for(&self, user_id: &Uuid) -> PathBuf {
        self.state_dir.join(format!("continuum_{user_id}.json"))
    }

    /// Load the user's continuum (from cache, then disk), creating a new
    /// one on first contact.
    pub fn load_or_create(&self, user_id: Uuid) -> Result<Continuum> {
        if let Some(hit) = self.cache.lock().get(&user_id) {
            return Ok(hit.clone());
        }
        let path = self.path_for(&user_id);
        let continuum = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Infrastructure(format!("corrupt continuum file: {e}")))?
        } else {
            Continuum::new(user_id)
        };
        self.cache.lock().insert(user_id, continuum.clone());
        Ok(continuum)
    }

    /// Replace the cached working copy (no durable write).
    pub fn update_cache(&self, continuum: &Continuum) {
        self.cache.lock().insert(continuum.user_id, continuum.clone());
    }

    /// Atomically persist a continuum snapshot (temp file + rename).
    ///
    /// Turn persistence goes through [`crate::uow::UnitOfWork::commit`];
    /// direct calls are for out-of-turn mutations (segment collapse,
    /// postpone) that must survive a restart.
    pub fn persist(&self, continuum: &Continuum) -> Result<()> {
        let path = self.path_for(&continuum.user_id);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string(continuum)?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        self.cache.lock().insert(continuum.user_id, continuum.clone());
        Ok(())
    }

    /// Users with a cached working copy (collapse sweeper input).
    pub fn cached_users(&self) -> Vec<Uuid> {
        self.cache.lock().keys().copied().collect()
    }

    /// Read the durable snapshot, bypassing the cache. Test and audit use.
    pub fn load_persisted(&self, user_id: Uuid) -> Result<Option<Continuum>> {
        let path = self.path_for(&user_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw).map_err(|e| {
            Error::Infrastructure(format!("corrupt continuum file: {e}"))
        })?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_domain::message::{Role, SegmentMeta, SegmentStatus};

    fn sentinel_meta(status: SegmentStatus) -> MessageMetadata {
        MessageMetadata {
            segment: Some(SegmentMeta {
                is_segment_boundary: true,
                status,
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
        }
    }

    #[test]
    fn add_messages_returns_events() {
        let mut continuum = Continuum::new(Uuid::new_v4());
        let (msg, events) = continuum.add_user_message("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ContinuumDelta::UserMessageAdded { .. }));

        let (reply, events) =
            continuum.add_assistant_message("hi!", MessageMetadata::default());
        assert_eq!(reply.role, Role::Assistant);
        assert!(matches!(events[0], ContinuumDelta::AssistantMessageAdded { .. }));
        assert_eq!(continuum.messages.len(), 2);
        assert_eq!(continuum.turn_number(), 1);
    }

    #[test]
    fn messages_for_api_excludes_sentinels_and_prior_segments() {
        let mut continuum = Continuum::new(Uuid::new_v4());
        continuum.add_user_message("old question");
        continuum.add_assistant_message("old answer", MessageMetadata::default());
        // Collapsed boundary, then the fresh active one.
        continuum.messages.push(
            Message::assistant("[segment boundary]")
                .with_metadata(sentinel_meta(SegmentStatus::Collapsed)),
        );
        continuum.messages.push(
            Message::assistant("[segment boundary]")
                .with_metadata(sentinel_meta(SegmentStatus::Active)),
        );
        continuum.add_user_message("new question");

        let api = continuum.messages_for_api();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].content.extract_all_text(), "new question");
    }

    #[test]
    fn repository_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ContinuumRepository::new(dir.path().to_path_buf()).unwrap();
        let user = Uuid::new_v4();

        let mut continuum = repo.load_or_create(user).unwrap();
        continuum.add_user_message("persist me");
        repo.persist(&continuum).unwrap();

        let loaded = repo.load_persisted(user).unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.id, continuum.id);
    }

    #[test]
    fn cache_update_is_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ContinuumRepository::new(dir.path().to_path_buf()).unwrap();
        let user = Uuid::new_v4();

        let mut continuum = repo.load_or_create(user).unwrap();
        continuum.add_user_message("in memory only");
        repo.update_cache(&continuum);

        assert!(repo.load_persisted(user).unwrap().is_none());
    }
}
