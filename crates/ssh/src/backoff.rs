use std::time::Duration;

use common::ReconnectPolicy;
use rand::Rng;

/// Exponential reconnect delays: `initial * 2^n`, jittered, never above `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            initial: policy.initial_delay(),
            max: policy.max_delay(),
            jitter: policy.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);

        let base = self
            .initial
            .saturating_mul(1u32 << exp)
            .min(self.max);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
