//! Per-identity check-in cooldown ledger.
//!
//! Pure map state, no I/O. Written only on a successful attendance decision,
//! never on rejection; consulted, never mutated, during matching. Entries
//! are bounded by gallery size and live for the process lifetime unless an
//! administrator clears them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct CooldownLedger {
    last_success: HashMap<String, Instant>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful check-in at `now`.
    pub fn record_success(&mut self, identity_id: &str, now: Instant) {
        self.last_success.insert(identity_id.to_string(), now);
    }

    /// Time left before `identity_id` may check in again. Zero when no entry
    /// exists or the window has elapsed.
    pub fn remaining(&self, identity_id: &str, now: Instant, window: Duration) -> Duration {
        match self.last_success.get(identity_id) {
            Some(&at) => {
                let elapsed = now.saturating_duration_since(at);
                window.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    /// Administrative override: forget one identity's last check-in.
    pub fn clear(&mut self, identity_id: &str) -> bool {
        self.last_success.remove(identity_id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.last_success.clear();
    }

    pub fn len(&self) -> usize {
        self.last_success.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_success.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(20);

    #[test]
    fn test_unknown_identity_has_no_cooldown() {
        let ledger = CooldownLedger::new();
        assert_eq!(ledger.remaining("alice", Instant::now(), WINDOW), Duration::ZERO);
    }

    #[test]
    fn test_remaining_within_window() {
        let mut ledger = CooldownLedger::new();
        let t0 = Instant::now();
        ledger.record_success("alice", t0);

        let remaining = ledger.remaining("alice", t0 + Duration::from_secs(5), WINDOW);
        assert_eq!(remaining, Duration::from_secs(15));
    }

    #[test]
    fn test_expired_window() {
        let mut ledger = CooldownLedger::new();
        let t0 = Instant::now();
        ledger.record_success("alice", t0);

        assert_eq!(
            ledger.remaining("alice", t0 + Duration::from_secs(20), WINDOW),
            Duration::ZERO
        );
        assert_eq!(
            ledger.remaining("alice", t0 + Duration::from_secs(60), WINDOW),
            Duration::ZERO
        );
    }

    #[test]
    fn test_independent_per_identity() {
        let mut ledger = CooldownLedger::new();
        let t0 = Instant::now();
        ledger.record_success("alice", t0);

        assert_eq!(ledger.remaining("bob", t0 + Duration::from_secs(1), WINDOW), Duration::ZERO);
        assert!(ledger.remaining("alice", t0 + Duration::from_secs(1), WINDOW) > Duration::ZERO);
    }

    #[test]
    fn test_clear_is_administrative_override() {
        let mut ledger = CooldownLedger::new();
        let t0 = Instant::now();
        ledger.record_success("alice", t0);

        assert!(ledger.clear("alice"));
        assert!(!ledger.clear("alice"));
        assert_eq!(ledger.remaining("alice", t0 + Duration::from_secs(1), WINDOW), Duration::ZERO);
    }

    #[test]
    fn test_rerecord_restarts_window() {
        let mut ledger = CooldownLedger::new();
        let t0 = Instant::now();
        ledger.record_success("alice", t0);
        ledger.record_success("alice", t0 + Duration::from_secs(19));

        let remaining = ledger.remaining("alice", t0 + Duration::from_secs(20), WINDOW);
        assert_eq!(remaining, Duration::from_secs(19));
    }
}
