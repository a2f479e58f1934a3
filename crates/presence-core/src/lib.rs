//! presence-core — Liveness-gated face check-in engine.
//!
//! Matches live face embeddings against an in-RAM gallery, requires a
//! blink-then-stabilize liveness sequence before accepting, and enforces a
//! per-identity check-in cooldown. The crate does no I/O and no inference —
//! the camera pipeline, the embedding model, and the attendance store are
//! external collaborators behind typed interfaces.

pub mod cooldown;
pub mod coordinator;
pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod preprocess;
pub mod types;

pub use cooldown::CooldownLedger;
pub use coordinator::{AttendanceCoordinator, CoordinatorConfig};
pub use gallery::EmbeddingCache;
pub use liveness::{LivenessConfig, LivenessGate};
pub use matcher::Matcher;
pub use preprocess::{FaceTensor, Preprocessor, YuvFrame};
pub use types::{
    AttendanceResult, AttendanceSink, Diagnostics, Embedding, EyeProbs, FaceObservation,
    FaceProfile, FaceRect, MatchOutcome,
};
