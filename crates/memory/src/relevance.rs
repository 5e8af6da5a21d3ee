//! Hybrid memory relevance: vector similarity + BM25 lexical scoring, with
//! entity-weighted query priming and bounded link-graph expansion.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::entity_weights::{
    get_weight, ENTITY_BOOST_COEFFICIENT, FUZZY_MATCH_THRESHOLD, MAX_ENTITY_BOOST,
};
use crate::types::{LinkedMemory, MemoryRecord};

// BM25 parameters (standard Robertson defaults).
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named entity attached to a stored memory.
#[derive(Debug, Clone)]
pub struct MemoryEntity {
    pub text: String,
    pub entity_type: String,
}

/// A memory with its retrieval artifacts.
#[derive(Debug, Clone)]
pub struct StoredMemory {
    pub record: MemoryRecord,
    pub embedding: Vec<f32>,
    pub entities: Vec<MemoryEntity>,
}

/// Source of retrieval candidates.
pub trait MemoryStore: Send + Sync {
    fn candidates(&self) -> Vec<StoredMemory>;
}

/// In-memory store; production deployments back this with the long-term
/// memory database (embedding column + tsvector).
#[derive(Default)]
pub struct InMemoryStore {
    memories: RwLock<Vec<StoredMemory>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, memory: StoredMemory) {
        self.memories.write().push(memory);
    }

    pub fn len(&self) -> usize {
        self.memories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.read().is_empty()
    }
}

impl MemoryStore for InMemoryStore {
    fn candidates(&self) -> Vec<StoredMemory> {
        self.memories.read().clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scoring primitives
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb + 1e-9)
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// BM25 scores for the query against every candidate text, normalized to
/// `[0, 1]` by the max score in the batch.
fn bm25_scores(query: &str, docs: &[Vec<String>]) -> Vec<f32> {
    let n = docs.len();
    if n == 0 {
        return Vec::new();
    }
    let query_terms = tokenize(query);
    let avg_len: f32 = docs.iter().map(|d| d.len() as f32).sum::<f32>() / n as f32;

    // Document frequency per query term.
    let mut df: HashMap<&str, usize> = HashMap::new();
    for term in &query_terms {
        let count = docs.iter().filter(|d| d.iter().any(|t| t == term)).count();
        df.insert(term.as_str(), count);
    }

    let mut scores: Vec<f32> = docs
        .iter()
        .map(|doc| {
            let len_norm = BM25_K1 * (1.0 - BM25_B + BM25_B * doc.len() as f32 / avg_len.max(1.0));
            query_terms
                .iter()
                .map(|term| {
                    let tf = doc.iter().filter(|t| *t == term).count() as f32;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let dfi = df[term.as_str()] as f32;
                    let idf = (((n as f32 - dfi + 0.5) / (dfi + 0.5)) + 1.0).ln();
                    idf * tf * (BM25_K1 + 1.0) / (tf + len_norm)
                })
                .sum()
        })
        .collect();

    let max = scores.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for s in &mut scores {
            *s /= max;
        }
    }
    scores
}

/// Normalized similarity between two entity strings (1.0 = identical).
/// Levenshtein distance over lowercased text.
fn entity_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let dist = prev[b.len()] as f32;
    1.0 - dist / a.len().max(b.len()) as f32
}

/// Multiplicative boost factor from entity matches: 0.15 per weighted
/// match, capped at +0.3.
fn entity_boost(query_entities: &[MemoryEntity], memory_entities: &[MemoryEntity]) -> f32 {
    let mut boost = 0.0f32;
    for qe in query_entities {
        let matched = memory_entities
            .iter()
            .any(|me| entity_similarity(&qe.text, &me.text) >= FUZZY_MATCH_THRESHOLD);
        if matched {
            boost += ENTITY_BOOST_COEFFICIENT * get_weight(&qe.entity_type);
        }
    }
    1.0 + boost.min(MAX_ENTITY_BOOST)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Relevance service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
}

pub struct MemoryRelevanceService {
    store: Arc<dyn MemoryStore>,
    vector_weight: f32,
    text_weight: f32,
    max_link_depth: usize,
}

impl MemoryRelevanceService {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        vector_weight: f32,
        text_weight: f32,
        max_link_depth: usize,
    ) -> Self {
        Self { store, vector_weight, text_weight, max_link_depth }
    }

    /// Hybrid retrieval for a fingerprint query.
    pub fn get_relevant_memories(
        &self,
        fingerprint: &str,
        fingerprint_embedding: &[f32],
        query_entities: &[MemoryEntity],
        limit: usize,
    ) -> Vec<MemoryRecord> {
        self.search(fingerprint, fingerprint_embedding, query_entities, limit)
            .into_iter()
            .map(|s| s.record)
            .collect()
    }

    /// Hybrid retrieval returning scores (used by search-result display).
    pub fn search(
        &self,
        fingerprint: &str,
        fingerprint_embedding: &[f32],
        query_entities: &[MemoryEntity],
        limit: usize,
    ) -> Vec<ScoredMemory> {
        let candidates = self.store.candidates();
        if candidates.is_empty() {
            return Vec::new();
        }

        let docs: Vec<Vec<String>> =
            candidates.iter().map(|c| tokenize(&c.record.text)).collect();
        let lexical = bm25_scores(fingerprint, &docs);

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .zip(lexical)
            .map(|(candidate, bm25)| {
                let vector = cosine_similarity(fingerprint_embedding, &candidate.embedding).max(0.0);
                let hybrid = self.vector_weight * vector + self.text_weight * bm25;
                let boosted = hybrid * entity_boost(query_entities, &candidate.entities);
                let mut record = candidate.record;
                truncate_links(&mut record.linked_memories, self.max_link_depth);
                ScoredMemory { record, score: boosted }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        tracing::debug!(results = scored.len(), "hybrid retrieval complete");
        scored
    }
}

/// Limit link-graph depth on a retrieved record.
fn truncate_links(links: &mut Vec<LinkedMemory>, depth: usize) {
    if depth == 0 {
        links.clear();
        return;
    }
    for link in links {
        truncate_links(&mut link.linked_memories, depth - 1);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge & display clustering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Merge pinned and fresh memories: pinned first, both orders preserved,
/// no duplicate ids.
pub fn merge_memories(
    pinned: Vec<MemoryRecord>,
    fresh: Vec<MemoryRecord>,
) -> Vec<MemoryRecord> {
    let mut seen: Vec<Uuid> = pinned.iter().map(|m| m.id).collect();
    let mut merged = pinned;
    for memory in fresh {
        if !seen.contains(&memory.id) {
            seen.push(memory.id);
            merged.push(memory);
        }
    }
    merged
}

/// Cluster scored results for display: a clear leader (>0.15 ahead) stands
/// alone; otherwise all consecutive results within 0.15 of the top, capped
/// at 4; top-2 when the cluster degenerates.
pub fn cluster_for_display(results: &[ScoredMemory]) -> Vec<ScoredMemory> {
    match results {
        [] => Vec::new(),
        [only] => vec![only.clone()],
        [top, second, ..] => {
            if top.score - second.score > 0.15 {
                return vec![top.clone()];
            }
            let cluster: Vec<ScoredMemory> = results
                .iter()
                .take_while(|r| top.score - r.score <= 0.15)
                .take(4)
                .cloned()
                .collect();
            if cluster.len() >= 2 {
                cluster
            } else {
                results.iter().take(2).cloned().collect()
            }
        }
    }
}
