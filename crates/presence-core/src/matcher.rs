//! Linear nearest-neighbor search over the gallery snapshot.
//!
//! The matcher is threshold-agnostic and deterministic: it reports the
//! nearest neighbor and its distance, and the caller decides what the
//! distance means. The one exception is [`detect_duplicate`], which applies
//! the enrollment-time duplicate threshold itself.
//!
//! [`detect_duplicate`]: Matcher::detect_duplicate

use crate::gallery::EmbeddingCache;
use crate::types::{Embedding, MatchOutcome};
use std::sync::Arc;

/// Nearest-neighbor matcher over an injected [`EmbeddingCache`].
#[derive(Clone)]
pub struct Matcher {
    cache: Arc<EmbeddingCache>,
}

impl Matcher {
    pub fn new(cache: Arc<EmbeddingCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Find the nearest gallery entry to `query`.
    ///
    /// Always iterates every entry (no early exit). Zero embeddings and
    /// entries of mismatched dimensionality are never candidates. Ties are
    /// broken by gallery iteration order: the first entry at the minimum
    /// distance wins, which keeps boundary tests reproducible.
    pub fn match_query(&self, query: &Embedding) -> MatchOutcome {
        let gallery = self.cache.snapshot();
        if gallery.is_empty() {
            return MatchOutcome::NoGalleryData;
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, profile) in gallery.iter().enumerate() {
            if profile.embedding.is_zero() || profile.embedding.len() != query.len() {
                continue;
            }
            let dist = query.cosine_distance(&profile.embedding);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((i, dist));
            }
        }

        match best {
            Some((i, distance)) => MatchOutcome::Candidate {
                profile: gallery[i].clone(),
                distance,
            },
            None => MatchOutcome::NoCandidate,
        }
    }

    /// Enrollment-time duplicate guard: the identity of the first profile
    /// strictly under `duplicate_threshold`, if any.
    ///
    /// This threshold is deliberately stricter than the recognition
    /// rejection threshold — it catches the same physical person being
    /// enrolled twice under different identities.
    pub fn detect_duplicate(&self, query: &Embedding, duplicate_threshold: f32) -> Option<String> {
        let gallery = self.cache.snapshot();
        for profile in gallery.iter() {
            if profile.embedding.is_zero() || profile.embedding.len() != query.len() {
                continue;
            }
            if query.cosine_distance(&profile.embedding) < duplicate_threshold {
                tracing::warn!(
                    existing = %profile.identity_id,
                    "enrollment rejected — embedding duplicates an enrolled identity"
                );
                return Some(profile.identity_id.clone());
            }
        }
        None
    }
}
