//! Long-term memory record shapes (read-only from the core's view).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A surfaced long-term memory. Links form a bounded-depth graph the core
/// traverses but never mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub text: String,
    /// In `[0, 1]`.
    pub importance_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub happens_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub is_refined: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_memories: Vec<LinkedMemory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedMemory {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub link_metadata: LinkMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_memories: Vec<LinkedMemory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkMetadata {
    #[serde(default = "default_link_type")]
    pub link_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

fn default_link_type() -> String {
    "unknown".into()
}

/// Confidence tiers used by downstream display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn of(confidence: f32) -> Self {
        if confidence >= 0.7 {
            ConfidenceTier::High
        } else if confidence >= 0.5 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_tiers() {
        assert_eq!(ConfidenceTier::of(0.9), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::of(0.7), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::of(0.6), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::of(0.5), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::of(0.49), ConfidenceTier::Low);
    }
}
