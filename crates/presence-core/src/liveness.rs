//! Blink-then-stabilize liveness gate.
//!
//! A printed photograph matches the gallery perfectly but cannot blink: the
//! gate refuses to progress past [`AwaitingBlink`] until an eye-closure is
//! observed. A short video loop CAN blink, so the blink alone is never
//! proof — after the eyes reopen, the same identity must stay well-matched
//! for several more consecutive frames before the gate reports success.
//!
//! [`AwaitingBlink`]: GateEvent::AwaitingBlink

use crate::types::{EyeProbs, FaceProfile};

/// Liveness tuning constants.
///
/// These are product-tuned configuration values, not derived from a
/// calibration procedure. Any change is a security-relevant review item:
/// loosening them widens the window for replay and crossover attacks.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// An eye-openness probability below this counts as a closed eye.
    pub blink_closed_threshold: f32,
    /// Both eyes must report at or above this for a frame to count toward
    /// stability — the eyes must have genuinely reopened.
    pub eye_open_recovery: f32,
    /// Consecutive qualifying frames required after the blink.
    pub required_stability: u32,
    /// Consecutive unmatched frames tolerated while a session is locked
    /// before the whole session resets.
    pub max_unmatched_retries: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            blink_closed_threshold: 0.25,
            eye_open_recovery: 0.65,
            required_stability: 4,
            max_unmatched_retries: 15,
        }
    }
}

/// Transient per-face tracking state. All fields reset together — a partial
/// reset would let one person's progress leak into another's session.
#[derive(Debug, Clone, Default)]
pub struct TrackingSession {
    pub locked_identity: Option<String>,
    pub blink_observed: bool,
    pub stability_count: u32,
    pub unmatched_retry_count: u32,
}

/// What the gate observed this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    /// No session and no usable candidate.
    Idle,
    /// Locked onto an identity, waiting for a blink.
    AwaitingBlink { name: String },
    /// Blink seen; accumulating post-reopen stability.
    Verifying { name: String, progress: u32 },
    /// The stability requirement is met. The caller owns what happens next
    /// (cooldown check, persistence); the gate itself stays locked until
    /// reset.
    StabilityReached { profile: FaceProfile },
    /// A locked session saw an unmatched frame within the retry budget.
    UnmatchedRetry { retries: u32 },
    /// The session was torn down this frame.
    SessionReset { reason: ResetReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// A different identity matched mid-session. Its trust accumulator must
    /// not transfer; the newcomer is evaluated from scratch on a later frame.
    IdentitySwitch,
    /// Too many consecutive frames matched no one.
    RetryBudgetExhausted,
}

/// The per-session liveness state machine, advanced once per frame.
#[derive(Debug, Default)]
pub struct LivenessGate {
    config: LivenessConfig,
    session: TrackingSession,
}

impl LivenessGate {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            session: TrackingSession::default(),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    /// Full session reset. Safe to call in any state.
    pub fn reset(&mut self) {
        self.session = TrackingSession::default();
    }

    /// Drive the state machine with this frame's match candidate (already
    /// filtered by the rejection threshold) and eye-openness probabilities.
    pub fn advance(&mut self, candidate: Option<(&FaceProfile, f32)>, eyes: EyeProbs) -> GateEvent {
        let Some((profile, _distance)) = candidate else {
            return self.advance_unmatched();
        };

        match &self.session.locked_identity {
            Some(locked) if locked != &profile.identity_id => {
                // Anti-crossover: a second face must never inherit the
                // first face's blink or stability progress.
                tracing::debug!(
                    locked = %locked,
                    newcomer = %profile.identity_id,
                    "identity switched mid-session — resetting"
                );
                self.reset();
                return GateEvent::SessionReset {
                    reason: ResetReason::IdentitySwitch,
                };
            }
            Some(_) => {}
            None => {
                self.session.locked_identity = Some(profile.identity_id.clone());
                tracing::debug!(identity = %profile.identity_id, "session locked");
            }
        }
        self.session.unmatched_retry_count = 0;

        if !self.session.blink_observed {
            if eyes.any_below(self.config.blink_closed_threshold) {
                self.session.blink_observed = true;
                self.session.stability_count = 0;
                tracing::debug!(identity = ?self.session.locked_identity, "blink observed");
                return GateEvent::Verifying {
                    name: profile.display_name.clone(),
                    progress: 0,
                };
            }
            return GateEvent::AwaitingBlink {
                name: profile.display_name.clone(),
            };
        }

        // Post-blink: only frames with genuinely reopened eyes qualify.
        if eyes.both_at_least(self.config.eye_open_recovery) {
            self.session.stability_count += 1;
            if self.session.stability_count >= self.config.required_stability {
                return GateEvent::StabilityReached {
                    profile: profile.clone(),
                };
            }
        }

        GateEvent::Verifying {
            name: profile.display_name.clone(),
            progress: self.session.stability_count,
        }
    }

    fn advance_unmatched(&mut self) -> GateEvent {
        if self.session.locked_identity.is_none() {
            return GateEvent::Idle;
        }

        self.session.unmatched_retry_count += 1;
        if self.session.unmatched_retry_count > self.config.max_unmatched_retries {
            tracing::debug!(
                identity = ?self.session.locked_identity,
                "unmatched retry budget exhausted — resetting"
            );
            self.reset();
            return GateEvent::SessionReset {
                reason: ResetReason::RetryBudgetExhausted,
            };
        }
        GateEvent::UnmatchedRetry {
            retries: self.session.unmatched_retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Embedding, EMBEDDING_DIM};

    fn profile(id: &str) -> FaceProfile {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[0] = 1.0;
        FaceProfile {
            identity_id: id.to_string(),
            display_name: id.to_uppercase(),
            embedding: Embedding::normalized_lossy(v),
            metadata: None,
        }
    }

    const OPEN: EyeProbs = EyeProbs {
        left: Some(0.95),
        right: Some(0.95),
    };
    const CLOSED: EyeProbs = EyeProbs {
        left: Some(0.05),
        right: Some(0.05),
    };
    const HALF_OPEN: EyeProbs = EyeProbs {
        left: Some(0.45),
        right: Some(0.45),
    };

    #[test]
    fn test_idle_without_candidate() {
        let mut gate = LivenessGate::default();
        assert_eq!(gate.advance(None, OPEN), GateEvent::Idle);
        assert!(gate.session().locked_identity.is_none());
    }

    #[test]
    fn test_candidate_locks_and_awaits_blink() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        let ev = gate.advance(Some((&alice, 0.1)), OPEN);
        assert_eq!(
            ev,
            GateEvent::AwaitingBlink {
                name: "ALICE".into()
            }
        );
        assert_eq!(gate.session().locked_identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_static_photo_stalls_forever() {
        // Open eyes on every frame: no blink, no progress, ever.
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        for _ in 0..100 {
            let ev = gate.advance(Some((&alice, 0.1)), OPEN);
            assert!(matches!(ev, GateEvent::AwaitingBlink { .. }));
        }
        assert!(!gate.session().blink_observed);
        assert_eq!(gate.session().stability_count, 0);
    }

    #[test]
    fn test_blink_enters_verifying() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);
        let ev = gate.advance(Some((&alice, 0.1)), CLOSED);
        assert_eq!(
            ev,
            GateEvent::Verifying {
                name: "ALICE".into(),
                progress: 0
            }
        );
        assert!(gate.session().blink_observed);
    }

    #[test]
    fn test_blink_then_stability_run() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);
        gate.advance(Some((&alice, 0.1)), CLOSED);

        for expected in 1..4 {
            let ev = gate.advance(Some((&alice, 0.1)), OPEN);
            assert_eq!(
                ev,
                GateEvent::Verifying {
                    name: "ALICE".into(),
                    progress: expected
                }
            );
        }
        let ev = gate.advance(Some((&alice, 0.1)), OPEN);
        assert!(matches!(ev, GateEvent::StabilityReached { .. }));
    }

    #[test]
    fn test_half_open_eyes_do_not_qualify() {
        // One-blink video loop defense: eyes must fully reopen.
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);
        gate.advance(Some((&alice, 0.1)), CLOSED);
        for _ in 0..10 {
            let ev = gate.advance(Some((&alice, 0.1)), HALF_OPEN);
            assert_eq!(
                ev,
                GateEvent::Verifying {
                    name: "ALICE".into(),
                    progress: 0
                }
            );
        }
    }

    #[test]
    fn test_anti_crossover_resets_fully() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        let bob = profile("bob");

        gate.advance(Some((&alice, 0.1)), OPEN);
        gate.advance(Some((&alice, 0.1)), CLOSED);
        gate.advance(Some((&alice, 0.1)), OPEN);
        assert_eq!(gate.session().stability_count, 1);

        let ev = gate.advance(Some((&bob, 0.1)), OPEN);
        assert_eq!(
            ev,
            GateEvent::SessionReset {
                reason: ResetReason::IdentitySwitch
            }
        );
        // No leakage: bob starts from scratch on the next frame.
        assert!(gate.session().locked_identity.is_none());
        assert!(!gate.session().blink_observed);
        assert_eq!(gate.session().stability_count, 0);

        let ev = gate.advance(Some((&bob, 0.1)), OPEN);
        assert_eq!(ev, GateEvent::AwaitingBlink { name: "BOB".into() });
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);

        for i in 1..=15 {
            let ev = gate.advance(None, OPEN);
            assert_eq!(ev, GateEvent::UnmatchedRetry { retries: i });
        }
        let ev = gate.advance(None, OPEN);
        assert_eq!(
            ev,
            GateEvent::SessionReset {
                reason: ResetReason::RetryBudgetExhausted
            }
        );
        assert!(gate.session().locked_identity.is_none());
    }

    #[test]
    fn test_matched_frame_zeroes_retry_counter() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);

        for _ in 0..10 {
            gate.advance(None, OPEN);
        }
        assert_eq!(gate.session().unmatched_retry_count, 10);
        gate.advance(Some((&alice, 0.1)), OPEN);
        assert_eq!(gate.session().unmatched_retry_count, 0);
    }

    #[test]
    fn test_reset_after_partial_progress() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        gate.advance(Some((&alice, 0.1)), OPEN);
        gate.advance(Some((&alice, 0.1)), CLOSED);
        gate.advance(Some((&alice, 0.1)), OPEN);
        gate.advance(Some((&alice, 0.1)), OPEN);
        assert_eq!(gate.session().stability_count, 2);

        // Face lost before the requirement was met.
        gate.reset();
        assert_eq!(gate.session().stability_count, 0);
        assert!(gate.session().locked_identity.is_none());
        assert!(!gate.session().blink_observed);
    }

    #[test]
    fn test_absent_eye_probs_cannot_blink_or_qualify() {
        let mut gate = LivenessGate::default();
        let alice = profile("alice");
        let absent = EyeProbs::default();

        let ev = gate.advance(Some((&alice, 0.1)), absent);
        assert!(matches!(ev, GateEvent::AwaitingBlink { .. }));

        // Blink with real probs, then absent probs must not add stability.
        gate.advance(Some((&alice, 0.1)), CLOSED);
        let ev = gate.advance(Some((&alice, 0.1)), absent);
        assert_eq!(
            ev,
            GateEvent::Verifying {
                name: "ALICE".into(),
                progress: 0
            }
        );
    }
}
