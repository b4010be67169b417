use std::time::Duration;

/// What a connection does after its transport drops on its own.
///
/// Disabled by default: a remote close just leaves the connection closed.
/// When enabled, reconnects back off exponentially (`base * 2^(n-1)`, capped
/// at `max_delay`); the attempt counter resets after every successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub const fn exponential(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        compute_backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

fn compute_backoff_delay(attempt: usize, base: Duration, max_delay: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31) as u32;
    let multiplier = 2u32.saturating_pow(exponent) as f64;
    let scaled = base.as_secs_f64() * multiplier;
    Duration::from_secs_f64(scaled.min(max_delay.as_secs_f64()))
}
