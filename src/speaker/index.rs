//! In-memory voiceprint index.
//!
//! Holds the complete embedding set per speaker for fast nearest-match
//! lookup. The index is always rebuilt from (and kept consistent with) the
//! persisted database; registration replaces a speaker's full vector list.

use std::collections::HashMap;

/// Cosine similarity of two vectors. Mismatched lengths and zero-norm
/// inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// A speaker's score against a query is the maximum cosine over the
/// speaker's stored vectors.
pub fn max_similarity(query: &[f32], embeddings: &[Vec<f32>]) -> f32 {
    embeddings
        .iter()
        .map(|e| cosine_similarity(query, e))
        .fold(0.0, f32::max)
}

pub struct EmbeddingIndex {
    dim: usize,
    entries: HashMap<String, Vec<Vec<f32>>>,
}

impl EmbeddingIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Register a speaker's complete vector list, replacing any previous
    /// registration. Rejects vectors of the wrong dimension.
    pub fn register(&mut self, speaker_id: &str, embeddings: &[Vec<f32>]) -> bool {
        if embeddings.is_empty() || embeddings.iter().any(|e| e.len() != self.dim) {
            return false;
        }
        self.entries
            .insert(speaker_id.to_string(), embeddings.to_vec());
        true
    }

    pub fn remove(&mut self, speaker_id: &str) -> bool {
        self.entries.remove(speaker_id).is_some()
    }

    /// Best match at the threshold, or `None` when no speaker scores high
    /// enough (including the empty-index case).
    pub fn search(&self, query: &[f32], threshold: f32) -> Option<String> {
        let mut best: Option<(&str, f32)> = None;
        for (speaker_id, embeddings) in &self.entries {
            let score = max_similarity(query, embeddings);
            if score >= threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((speaker_id, score));
            }
        }
        best.map(|(id, _)| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
