use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Embedding dimensionality fixed by the MobileFaceNet model.
pub const EMBEDDING_DIM: usize = 192;

/// Magnitudes below this are treated as the zero vector.
const ZERO_NORM_EPSILON: f32 = 1e-10;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    WrongLength(usize),
    #[error("embedding contains a non-finite value")]
    NonFinite,
    #[error("zero-magnitude embedding — the model produced an invalid vector")]
    ZeroMagnitude,
}

/// An L2-normalized face embedding.
///
/// The field is private so a non-normalized vector can never enter a
/// comparison: every constructor normalizes. A zero-magnitude input either
/// fails ([`from_raw`](Self::from_raw), the query path) or becomes the zero
/// vector ([`normalized_lossy`](Self::normalized_lossy), the storage path);
/// a zero embedding is never a valid match candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize a raw model output for use as a query.
    ///
    /// Rejects wrong-length, non-finite, and zero-magnitude vectors — the
    /// model is never trusted to pre-normalize.
    pub fn from_raw(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::WrongLength(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < ZERO_NORM_EPSILON {
            return Err(EmbeddingError::ZeroMagnitude);
        }
        Ok(Self {
            values: values.iter().map(|v| v / norm).collect(),
        })
    }

    /// Normalize for storage. A zero-magnitude vector becomes the zero
    /// vector instead of an error; the matcher skips zero entries.
    pub fn normalized_lossy(values: Vec<f32>) -> Self {
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < ZERO_NORM_EPSILON || !norm.is_finite() {
            return Self {
                values: vec![0.0; values.len()],
            };
        }
        Self {
            values: values.iter().map(|v| v / norm).collect(),
        }
    }

    /// Cosine distance `1 − a·b`. Both sides are pre-normalized, so the dot
    /// product alone suffices. Always iterates every dimension.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|&v| v == 0.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// An enrolled identity. Created by the enrollment collaborator; the core
/// never mutates one — the unit of update is a whole gallery refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceProfile {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    /// Classification metadata (class, grade, …). Carried, never interpreted.
    pub metadata: Option<serde_json::Value>,
}

/// Face bounding rectangle in upright (rotation-corrected) pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Per-frame eye-openness probabilities from the detector collaborator.
/// `None` means the detector could not classify that eye this frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EyeProbs {
    pub left: Option<f32>,
    pub right: Option<f32>,
}

impl EyeProbs {
    pub fn new(left: Option<f32>, right: Option<f32>) -> Self {
        Self { left, right }
    }

    pub fn both(left: f32, right: f32) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    /// True when either eye is reported below `threshold` (a blink).
    /// Absent probabilities never count as closed.
    pub fn any_below(&self, threshold: f32) -> bool {
        self.left.map_or(false, |p| p < threshold) || self.right.map_or(false, |p| p < threshold)
    }

    /// True when both eyes are reported at or above `threshold`.
    /// Absent probabilities never count as open.
    pub fn both_at_least(&self, threshold: f32) -> bool {
        self.left.map_or(false, |p| p >= threshold) && self.right.map_or(false, |p| p >= threshold)
    }
}

/// One detection from the camera/detector collaborator: where the primary
/// face sits in the frame and how its eyes look.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub rect: FaceRect,
    /// Clockwise sensor rotation in degrees (0/90/180/270).
    pub rotation: i32,
    /// Whether the frame comes from a mirrored front camera.
    pub mirrored: bool,
    pub eyes: EyeProbs,
}

/// Result of a nearest-neighbor query. Produced fresh per query, never cached.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The gallery snapshot is empty.
    NoGalleryData,
    /// The gallery has entries but none was comparable.
    NoCandidate,
    /// The nearest neighbor. Threshold-agnostic: the caller decides whether
    /// `distance` is close enough to mean anything.
    Candidate { profile: FaceProfile, distance: f32 },
}

/// The per-frame outcome surfaced to the UI collaborator. This is the only
/// state an external observer should act on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttendanceResult {
    Idle,
    AwaitingBlink {
        name: String,
    },
    Verifying {
        name: String,
        progress: u32,
        required: u32,
    },
    Accepted {
        name: String,
    },
    OnCooldown {
        name: String,
        seconds_remaining: u64,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlinkStatus {
    #[default]
    Waiting,
    Observed,
}

/// Operator-facing debug overlay data. Informational only — nothing in the
/// gating path may read it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub best_distance: f32,
    pub label: String,
    pub blink: BlinkStatus,
    pub stability: u32,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            best_distance: 0.0,
            label: "standby".to_string(),
            blink: BlinkStatus::Waiting,
            stability: 0,
        }
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct SinkError(pub String);

/// The attendance-recording collaborator. Invoked exactly once per accepted
/// check-in; the implementation owns durability and any cloud sync.
pub trait AttendanceSink {
    fn record(
        &mut self,
        identity_id: &str,
        display_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    #[test]
    fn test_from_raw_normalizes() {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 3.0;
        v[1] = 4.0;
        let e = Embedding::from_raw(v).unwrap();
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_rejects_wrong_length() {
        let err = Embedding::from_raw(vec![1.0; 64]).unwrap_err();
        assert!(matches!(err, EmbeddingError::WrongLength(64)));
    }

    #[test]
    fn test_from_raw_rejects_zero_vector() {
        let err = Embedding::from_raw(vec![0.0; EMBEDDING_DIM]).unwrap_err();
        assert!(matches!(err, EmbeddingError::ZeroMagnitude));
    }

    #[test]
    fn test_from_raw_rejects_nan() {
        let mut v = vec![0.5f32; EMBEDDING_DIM];
        v[17] = f32::NAN;
        let err = Embedding::from_raw(v).unwrap_err();
        assert!(matches!(err, EmbeddingError::NonFinite));
    }

    #[test]
    fn test_normalized_lossy_zero_becomes_zero_vector() {
        let e = Embedding::normalized_lossy(vec![0.0; EMBEDDING_DIM]);
        assert!(e.is_zero());
        assert_eq!(e.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let e = Embedding::from_raw(unit(0)).unwrap();
        assert!(e.cosine_distance(&e).abs() < 1e-6);
    }

    #[test]
    fn test_distance_symmetry_and_range() {
        let a = Embedding::from_raw(unit(0)).unwrap();
        let b = Embedding::from_raw(unit(1)).unwrap();
        let mut neg = unit(0);
        neg[0] = -1.0;
        let c = Embedding::from_raw(neg).unwrap();

        assert!((a.cosine_distance(&b) - b.cosine_distance(&a)).abs() < 1e-6);
        // Orthogonal vectors sit at 1.0, opposite vectors at 2.0.
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
        assert!((a.cosine_distance(&c) - 2.0).abs() < 1e-6);
        assert!(a.cosine_distance(&b) >= 0.0 && a.cosine_distance(&c) <= 2.0);
    }

    #[test]
    fn test_eye_probs_blink_detection() {
        assert!(EyeProbs::both(0.1, 0.9).any_below(0.25));
        assert!(EyeProbs::both(0.9, 0.1).any_below(0.25));
        assert!(!EyeProbs::both(0.9, 0.9).any_below(0.25));
        // Absent probabilities never count as closed.
        assert!(!EyeProbs::new(None, None).any_below(0.25));
    }

    #[test]
    fn test_eye_probs_recovery_requires_both() {
        assert!(EyeProbs::both(0.8, 0.7).both_at_least(0.65));
        assert!(!EyeProbs::both(0.8, 0.3).both_at_least(0.65));
        assert!(!EyeProbs::new(Some(0.9), None).both_at_least(0.65));
    }
}
