//! In-RAM gallery of enrolled identities.
//!
//! The whole gallery is the unit of update: `refresh` builds a new snapshot
//! off to the side and publishes it with one atomic swap, so readers never
//! observe a partially-updated gallery.

use crate::types::{Embedding, FaceProfile};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Versioned, swappable snapshot of all enrolled profiles for the active
/// tenant. Empty at construction; populated by an explicit [`refresh`]
/// and emptied by [`clear`] on tenant logout — stale identities must never
/// answer queries for the next tenant.
///
/// [`refresh`]: Self::refresh
/// [`clear`]: Self::clear
#[derive(Debug)]
pub struct EmbeddingCache {
    snapshot: RwLock<Arc<Vec<FaceProfile>>>,
    version: AtomicU64,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            version: AtomicU64::new(0),
        }
    }

    /// Replace the entire gallery. Every embedding is re-normalized on the
    /// way in; a zero-magnitude embedding becomes the zero vector and is
    /// skipped by the matcher.
    pub fn refresh(&self, profiles: Vec<FaceProfile>) {
        let normalized: Vec<FaceProfile> = profiles
            .into_iter()
            .map(|p| {
                let FaceProfile {
                    identity_id,
                    display_name,
                    embedding,
                    metadata,
                } = p;
                FaceProfile {
                    identity_id,
                    display_name,
                    embedding: Embedding::normalized_lossy(embedding.into_values()),
                    metadata,
                }
            })
            .collect();

        let count = normalized.len();
        let next = Arc::new(normalized);
        {
            let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            *guard = next;
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(count, version, "gallery refreshed");
    }

    /// Empty the gallery. Sequentially consistent: takes effect before the
    /// next `snapshot()` observed by any thread.
    pub fn clear(&self) {
        self.refresh(Vec::new());
        tracing::info!("gallery cleared");
    }

    /// Current snapshot. The returned `Arc` stays valid across concurrent
    /// refreshes; callers hold it for the duration of one query.
    pub fn snapshot(&self) -> Arc<Vec<FaceProfile>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}
