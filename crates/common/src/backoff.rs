use rand::Rng;
use std::time::Duration;

/// Reconnect delay that doubles per attempt up to a ceiling.
///
/// Each delay is spread by up to `jitter` of itself in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
    jitter: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }
}

impl ExponentialBackoff {
    /// `jitter` is a fraction of the delay, clamped to `0.0..=1.0`.
    pub fn new(base: Duration, ceiling: Duration, jitter: f64) -> Self {
        Self {
            base,
            ceiling,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay for the current attempt before jitter.
    pub fn current(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Jittered delay for the current attempt; moves on to the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Start over from `base`, e.g. after a connection that stayed up.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Counts consecutive connection sessions that died quickly.
///
/// A session that lasted at least `stable_threshold` clears the count. Once
/// `max_rapid_failures` short sessions happen in a row the budget is
/// exhausted and the caller should stop reconnecting.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    stable_threshold: Duration,
    max_rapid_failures: u32,
    rapid_failures: u32,
}

impl RetryBudget {
    pub fn new(stable_threshold: Duration, max_rapid_failures: u32) -> Self {
        Self {
            stable_threshold,
            max_rapid_failures,
            rapid_failures: 0,
        }
    }

    /// Records how long the last session lived. Returns true if it was stable.
    pub fn record_session(&mut self, lived: Duration) -> bool {
        if lived >= self.stable_threshold {
            self.rapid_failures = 0;
            true
        } else {
            self.rapid_failures = self.rapid_failures.saturating_add(1);
            false
        }
    }

    /// Records a connect attempt that never produced a session.
    pub fn record_connect_failure(&mut self) {
        self.rapid_failures = self.rapid_failures.saturating_add(1);
    }

    pub fn rapid_failures(&self) -> u32 {
        self.rapid_failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_rapid_failures > 0 && self.rapid_failures >= self.max_rapid_failures
    }
}
