/// Exponential backoff keyed by attempt number
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next try, given how many attempts have already failed.
    /// `failures == 0` means no wait.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.base_delay_for(failures);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        let jittered = Duration::from_millis((base.as_millis() as f64 * factor) as u64);
        jittered.min(self.max)
    }

    /// Un-jittered delay: `initial * multiplier^(failures - 1)`, capped at `max`
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(63) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
