//! Unit of Work: per-turn batch of persistence operations, committed
//! atomically at the end of `process_message`.
//!
//! A mid-turn failure leaves the in-memory continuum mutated but writes
//! nothing durable — all-or-nothing at turn granularity.

use mira_domain::message::Message;
use mira_domain::Result;

use crate::continuum::{Continuum, ContinuumRepository};

#[derive(Default)]
pub struct UnitOfWork {
    /// Messages to persist, in storage-tier form. Matched to the in-memory
    /// continuum by message id at commit time.
    pending: Vec<Message>,
    metadata_updated: bool,
    committed: bool,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the turn's user and assistant messages for persistence. The
    /// user message may differ from the in-memory one in content only
    /// (storage-tier image data); ids must match.
    pub fn add_messages(&mut self, user_message: Message, assistant_message: Message) {
        self.pending.push(user_message);
        self.pending.push(assistant_message);
    }

    pub fn mark_metadata_updated(&mut self) {
        self.metadata_updated = true;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Commit: snapshot the in-memory continuum with storage-tier content
    /// substituted by message id, and write it atomically.
    pub fn commit(&mut self, repo: &ContinuumRepository, continuum: &Continuum) -> Result<()> {
        let mut snapshot = continuum.clone();
        for staged in &self.pending {
            if let Some(slot) = snapshot.messages.iter_mut().find(|m| m.id == staged.id) {
                slot.content = staged.content.clone();
                slot.metadata = staged.metadata.clone();
            }
        }
        repo.persist(&snapshot)?;
        self.committed = true;
        self.pending.clear();
        tracing::debug!(
            continuum_id = %continuum.id,
            messages = snapshot.messages.len(),
            metadata_updated = self.metadata_updated,
            "unit of work committed"
        );
        Ok(())
    }
}
