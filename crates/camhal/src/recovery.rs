//! Would-block and decode-failure accounting.
//!
//! Both failure kinds are measured as a span of wall time starting at the
//! first failure after a success. A span longer than the current threshold
//! asks for exactly one forced reset and restarts the window. The threshold
//! starts at the initial grace period and drops to the steady value after the
//! first good frame or the first reset.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub initial_grace: Duration,
    pub reset_threshold: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial_grace: Duration::from_secs(5),
            reset_threshold: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Continue,
    ForceReset,
}

#[derive(Debug, Default)]
struct FailureWindow {
    since: Option<Instant>,
    count: u32,
}

impl FailureWindow {
    fn record(&mut self, now: Instant, threshold: Duration) -> bool {
        self.count += 1;
        let since = *self.since.get_or_insert(now);
        if now.saturating_duration_since(since) > threshold {
            self.clear();
            return true;
        }
        false
    }

    fn clear(&mut self) {
        self.since = None;
        self.count = 0;
    }
}

pub struct ErrorRecovery {
    policy: RecoveryPolicy,
    threshold: Duration,
    would_block: FailureWindow,
    decode: FailureWindow,
    resets: u32,
}

impl ErrorRecovery {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            threshold: policy.initial_grace,
            would_block: FailureWindow::default(),
            decode: FailureWindow::default(),
            resets: 0,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn would_block_count(&self) -> u32 {
        self.would_block.count
    }

    pub fn decode_failures(&self) -> u32 {
        self.decode.count
    }

    /// Any failure since the last good frame.
    pub fn has_recent_failures(&self) -> bool {
        self.would_block.count > 0 || self.decode.count > 0
    }

    pub fn on_frame(&mut self) {
        self.would_block.clear();
        self.threshold = self.policy.reset_threshold;
    }

    pub fn on_would_block(&mut self, now: Instant) -> RecoveryAction {
        if self.would_block.record(now, self.threshold) {
            tracing::warn!(
                threshold_ms = self.threshold.as_millis() as u64,
                "Device stalled, forcing stream reset"
            );
            return self.reset();
        }
        RecoveryAction::Continue
    }

    pub fn on_decoded(&mut self) {
        self.decode.clear();
    }

    pub fn on_decode_failure(&mut self, now: Instant) -> RecoveryAction {
        if self.decode.record(now, self.threshold) {
            tracing::warn!(
                threshold_ms = self.threshold.as_millis() as u64,
                "Compressed stream corrupt, forcing stream reset"
            );
            return self.reset();
        }
        RecoveryAction::Continue
    }

    fn reset(&mut self) -> RecoveryAction {
        self.resets += 1;
        self.would_block.clear();
        self.decode.clear();
        self.threshold = self.policy.reset_threshold;
        RecoveryAction::ForceReset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy {
            initial_grace: Duration::from_millis(500),
            reset_threshold: Duration::from_millis(300),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_reset_exactly_when_span_exceeds_grace() {
        let mut recovery = ErrorRecovery::new(policy());
        let t0 = Instant::now();
        // Eleven would-blocks 50ms apart span exactly 500ms: no reset.
        for k in 0..=10 {
            assert_eq!(recovery.on_would_block(t0 + ms(k * 50)), RecoveryAction::Continue);
        }
        // One more crosses the grace period.
        assert_eq!(recovery.on_would_block(t0 + ms(550)), RecoveryAction::ForceReset);
        assert_eq!(recovery.resets(), 1);
        assert_eq!(recovery.would_block_count(), 0);
        assert_eq!(recovery.threshold(), ms(300));
    }

    #[test]
    fn test_second_window_uses_steady_threshold() {
        let mut recovery = ErrorRecovery::new(policy());
        let t0 = Instant::now();
        recovery.on_would_block(t0);
        assert_eq!(recovery.on_would_block(t0 + ms(501)), RecoveryAction::ForceReset);

        let t1 = t0 + ms(600);
        assert_eq!(recovery.on_would_block(t1), RecoveryAction::Continue);
        assert_eq!(recovery.on_would_block(t1 + ms(300)), RecoveryAction::Continue);
        assert_eq!(recovery.on_would_block(t1 + ms(301)), RecoveryAction::ForceReset);
        assert_eq!(recovery.resets(), 2);
    }

    #[test]
    fn test_good_frame_restarts_window() {
        let mut recovery = ErrorRecovery::new(policy());
        let t0 = Instant::now();
        recovery.on_would_block(t0);
        recovery.on_would_block(t0 + ms(200));
        assert!(recovery.has_recent_failures());
        recovery.on_frame();
        assert!(!recovery.has_recent_failures());
        assert_eq!(recovery.threshold(), ms(300));

        assert_eq!(recovery.on_would_block(t0 + ms(450)), RecoveryAction::Continue);
        assert_eq!(recovery.on_would_block(t0 + ms(700)), RecoveryAction::Continue);
        assert_eq!(recovery.resets(), 0);
    }

    #[test]
    fn test_decode_failures_tracked_separately() {
        let mut recovery = ErrorRecovery::new(policy());
        let t0 = Instant::now();
        recovery.on_would_block(t0);
        assert_eq!(recovery.on_decode_failure(t0 + ms(400)), RecoveryAction::Continue);
        recovery.on_frame();
        assert_eq!(recovery.decode_failures(), 1);
        // The good frame does not close the decode window.
        assert_eq!(recovery.on_decode_failure(t0 + ms(650)), RecoveryAction::Continue);
        assert_eq!(recovery.decode_failures(), 2);

        recovery.on_decoded();
        assert_eq!(recovery.decode_failures(), 0);
        recovery.on_decode_failure(t0 + ms(800));
        assert_eq!(recovery.on_decode_failure(t0 + ms(1101)), RecoveryAction::ForceReset);
    }
}
