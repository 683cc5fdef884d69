//! # Idle Backoff Module
//!
//! Adaptive delay between polls of an idle or failing queue.
//!
//! The delay is zero while messages keep arriving and grows exponentially,
//! with optional jitter, across consecutive empty or failed polls.

use crate::error::ValidationError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff configuration
///
/// # Examples
///
/// ```rust
/// use queue_pump::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(2), 2.0)
///     .without_jitter();
/// assert_eq!(policy.calculate_delay(0), Duration::from_millis(50));
/// assert_eq!(policy.calculate_delay(10), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first empty poll
    pub initial_delay: Duration,

    /// Upper bound for the delay
    pub max_delay: Duration,

    /// Growth factor per consecutive empty poll
    pub backoff_multiplier: f64,

    /// Whether to randomise delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay for the given 0-based step: `initial * multiplier^step`, capped
    pub fn calculate_delay(&self, step: u32) -> Duration {
        let exponent = step.min(64) as i32;
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        // Overflowing or non-finite values fall back to the cap
        Duration::try_from_secs_f64(final_delay_secs.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Reject policies whose delays cannot grow toward a reachable cap
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.initial_delay > self.max_delay {
            return Err(ValidationError::OutOfRange {
                field: "idle_backoff.initial_delay".to_string(),
                message: format!(
                    "{:?} exceeds max_delay {:?}",
                    self.initial_delay, self.max_delay
                ),
            });
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ValidationError::OutOfRange {
                field: "idle_backoff.backoff_multiplier".to_string(),
                message: format!("{} must be finite and at least 1.0", self.backoff_multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ValidationError::OutOfRange {
                field: "idle_backoff.jitter_percent".to_string(),
                message: format!("{} is outside 0.0..=1.0", self.jitter_percent),
            });
        }
        Ok(())
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// Tracks consecutive idle polls and yields the delay before the next one.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    policy: BackoffPolicy,
    consecutive_idle: u32,
}

impl IdleBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_idle: 0,
        }
    }

    /// Delay to wait before the next poll
    pub fn current_delay(&self) -> Duration {
        match self.consecutive_idle {
            0 => Duration::ZERO,
            n => self.policy.calculate_delay(n - 1),
        }
    }

    /// Record a poll that returned nothing or failed
    pub fn record_idle(&mut self) {
        self.consecutive_idle = self.consecutive_idle.saturating_add(1);
    }

    /// Record a poll that returned messages
    pub fn reset(&mut self) {
        self.consecutive_idle = 0;
    }

    pub fn consecutive_idle(&self) -> u32 {
        self.consecutive_idle
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
