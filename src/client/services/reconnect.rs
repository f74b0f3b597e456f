use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff used when the chat socket drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay added as random jitter (0.0 disables it)
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based), or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let base = self.base_delay(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return Some(base);
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        Some(std::cmp::min(base.mul_f64(1.0 + extra), self.max_delay))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt - 1);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }
}
