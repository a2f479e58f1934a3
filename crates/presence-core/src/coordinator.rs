//! Per-frame orchestration: match → liveness gate → cooldown → sink.
//!
//! The coordinator is single-owner state advanced only by `process_frame`;
//! the host guarantees at most one in-flight call (the daemon does this with
//! a single-flight frame channel), so no locking happens here.

use crate::cooldown::CooldownLedger;
use crate::gallery::EmbeddingCache;
use crate::liveness::{GateEvent, LivenessConfig, LivenessGate};
use crate::matcher::Matcher;
use crate::types::{
    AttendanceResult, AttendanceSink, BlinkStatus, Diagnostics, Embedding, EyeProbs, FaceProfile,
    MatchOutcome,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Distance reported in diagnostics when nothing comparable was found.
const NO_MATCH_DISTANCE: f32 = 9.99;

/// Check-in pipeline tuning. Thresholds are product-tuned configuration;
/// changing them is a security-relevant review item, not a cosmetic tweak.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Maximum nearest-neighbor distance treated as a genuine match. Beyond
    /// it the candidate is Unknown no matter how near it ranks — an
    /// unenrolled stranger always has SOME nearest neighbor.
    pub rejection_threshold: f32,
    /// Enrollment-time duplicate threshold, stricter than recognition.
    pub duplicate_threshold: f32,
    /// Window during which a second check-in for the same identity is
    /// suppressed.
    pub cooldown_window: Duration,
    /// How long each terminal result stays on screen before the session
    /// returns to idle.
    pub accepted_dwell: Duration,
    pub cooldown_dwell: Duration,
    pub rejected_dwell: Duration,
    pub liveness: LivenessConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rejection_threshold: 0.42,
            duplicate_threshold: 0.22,
            cooldown_window: Duration::from_secs(20),
            accepted_dwell: Duration::from_millis(3500),
            cooldown_dwell: Duration::from_millis(2500),
            rejected_dwell: Duration::from_millis(2000),
            liveness: LivenessConfig::default(),
        }
    }
}

/// Orchestrates one check-in decision per frame and reports it as an
/// [`AttendanceResult`]. On acceptance the attendance sink is invoked
/// exactly once.
pub struct AttendanceCoordinator<S: AttendanceSink> {
    config: CoordinatorConfig,
    matcher: Matcher,
    gate: LivenessGate,
    ledger: CooldownLedger,
    sink: S,
    /// Terminal result being displayed, with its expiry.
    hold: Option<(AttendanceResult, Instant)>,
    last_result: AttendanceResult,
    diagnostics: Diagnostics,
}

impl<S: AttendanceSink> AttendanceCoordinator<S> {
    pub fn new(cache: Arc<EmbeddingCache>, sink: S, config: CoordinatorConfig) -> Self {
        Self {
            matcher: Matcher::new(cache),
            gate: LivenessGate::new(config.liveness),
            ledger: CooldownLedger::new(),
            sink,
            config,
            hold: None,
            last_result: AttendanceResult::Idle,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Latest operator-facing debug info. Never feeds back into gating.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn cooldown_ledger_mut(&mut self) -> &mut CooldownLedger {
        &mut self.ledger
    }

    /// Advance the pipeline with one frame's raw model output and eye
    /// probabilities.
    pub fn process_frame(&mut self, raw_embedding: &[f32], eyes: EyeProbs) -> AttendanceResult {
        self.process_frame_at(raw_embedding, eyes, Instant::now())
    }

    /// [`process_frame`](Self::process_frame) with an injected clock, for
    /// deterministic tests.
    pub fn process_frame_at(
        &mut self,
        raw_embedding: &[f32],
        eyes: EyeProbs,
        now: Instant,
    ) -> AttendanceResult {
        // A terminal result stays on screen for its dwell; frames arriving
        // meanwhile are ignored.
        if let Some((held, until)) = &self.hold {
            if now < *until {
                return held.clone();
            }
        }
        if self.hold.take().is_some() {
            self.last_result = AttendanceResult::Idle;
            self.diagnostics = Diagnostics::default();
        }

        // A malformed model output is a transient hiccup: drop the frame but
        // keep the session — this is not evidence of face loss.
        let query = match Embedding::from_raw(raw_embedding.to_vec()) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!(error = %e, "invalid embedding — frame discarded");
                return self.last_result.clone();
            }
        };

        let candidate = match self.matcher.match_query(&query) {
            MatchOutcome::NoGalleryData => {
                self.gate.reset();
                self.set_diag(0.0, "no gallery data");
                self.last_result = AttendanceResult::Idle;
                return AttendanceResult::Idle;
            }
            MatchOutcome::NoCandidate => {
                self.set_diag(NO_MATCH_DISTANCE, "unknown");
                None
            }
            MatchOutcome::Candidate { profile, distance } => {
                if distance <= self.config.rejection_threshold {
                    self.set_diag(distance, &profile.display_name);
                    Some((profile, distance))
                } else {
                    // Never name an identity beyond the rejection threshold.
                    self.set_diag(distance, "unknown");
                    None
                }
            }
        };

        let event = self
            .gate
            .advance(candidate.as_ref().map(|(p, d)| (p, *d)), eyes);
        self.diagnostics.stability = self.gate.session().stability_count;
        self.diagnostics.blink = if self.gate.session().blink_observed {
            BlinkStatus::Observed
        } else {
            BlinkStatus::Waiting
        };

        let result = match event {
            GateEvent::Idle => AttendanceResult::Idle,
            GateEvent::SessionReset { .. } => AttendanceResult::Idle,
            GateEvent::AwaitingBlink { name } => AttendanceResult::AwaitingBlink { name },
            GateEvent::Verifying { name, progress } => AttendanceResult::Verifying {
                name,
                progress,
                required: self.config.liveness.required_stability,
            },
            // The session survives a miss; keep showing the current phase.
            GateEvent::UnmatchedRetry { .. } => self.last_result.clone(),
            GateEvent::StabilityReached { profile } => self.conclude(&profile, now),
        };

        self.last_result = result.clone();
        result
    }

    /// Stability met: consult the cooldown ledger, then persist.
    fn conclude(&mut self, profile: &FaceProfile, now: Instant) -> AttendanceResult {
        let remaining = self
            .ledger
            .remaining(&profile.identity_id, now, self.config.cooldown_window);
        if !remaining.is_zero() {
            tracing::info!(
                identity = %profile.identity_id,
                remaining_secs = remaining.as_secs(),
                "check-in suppressed by cooldown"
            );
            let result = AttendanceResult::OnCooldown {
                name: profile.display_name.clone(),
                seconds_remaining: remaining.as_secs(),
            };
            self.enter_hold(result.clone(), now + self.config.cooldown_dwell);
            return result;
        }

        match self
            .sink
            .record(&profile.identity_id, &profile.display_name, Utc::now())
        {
            Ok(()) => {
                // The ledger entry is written only after the sink accepted
                // the record — a failed save must allow an immediate retry.
                self.ledger.record_success(&profile.identity_id, now);
                tracing::info!(
                    identity = %profile.identity_id,
                    name = %profile.display_name,
                    "check-in accepted"
                );
                let result = AttendanceResult::Accepted {
                    name: profile.display_name.clone(),
                };
                self.enter_hold(result.clone(), now + self.config.accepted_dwell);
                result
            }
            Err(e) => {
                tracing::error!(identity = %profile.identity_id, error = %e, "check-in save failed");
                let result = AttendanceResult::Rejected {
                    reason: format!("save failed: {e}"),
                };
                self.enter_hold(result.clone(), now + self.config.rejected_dwell);
                result
            }
        }
    }

    fn enter_hold(&mut self, result: AttendanceResult, until: Instant) {
        self.gate.reset();
        self.hold = Some((result, until));
    }

    /// The tracked face left the frame: tear the session down immediately.
    /// A stale lock must never survive loss of visual tracking.
    pub fn on_face_lost(&mut self) {
        self.reset_all();
    }

    /// Explicit external cancel.
    pub fn force_reset(&mut self) {
        self.reset_all();
    }

    fn reset_all(&mut self) {
        self.hold = None;
        self.gate.reset();
        self.last_result = AttendanceResult::Idle;
        self.diagnostics = Diagnostics::default();
    }

    fn set_diag(&mut self, distance: f32, label: &str) {
        self.diagnostics.best_distance = distance;
        self.diagnostics.label = label.to_string();
    }
}
