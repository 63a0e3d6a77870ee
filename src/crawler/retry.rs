//! Retry decisions for failed fetches
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt counter, the
//! error class and the policy settings. Jitter is applied separately by
//! [`RetryPolicy::jittered`] so the decision itself stays deterministic.

use crate::config::SchedulerConfig;
use crate::task::{DeadLetterReason, ErrorClass};
use rand::Rng;
use std::time::Duration;

/// What to do with a task whose latest attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the task once `delay` has elapsed
    RetryAfter(Duration),
    /// Stop retrying
    DeadLetter(DeadLetterReason),
}

/// Exponential backoff with a cap and a hard attempt limit
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Creates a policy; `jitter` is clamped to `0.0..=0.5`
    pub fn new(max_attempts: u32, base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            max_attempts,
            base,
            max,
            jitter: jitter.clamp(0.0, 0.5),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_backoff(),
            config.max_backoff(),
            config.jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides the fate of a task that failed at `attempt`
    ///
    /// # Arguments
    ///
    /// * `attempt` - Retries already scheduled for the task (0 on the first fetch)
    /// * `class` - Classification of the failure
    ///
    /// # Returns
    ///
    /// * `DeadLetter(Permanent)` - for any non-retryable error
    /// * `DeadLetter(PoisonTask)` - once `attempt` has reached `max_attempts`
    /// * `RetryAfter(delay)` - otherwise, with `delay = min(base * 2^attempt, max)`
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if class == ErrorClass::Permanent {
            return RetryDecision::DeadLetter(DeadLetterReason::Permanent);
        }

        if attempt >= self.max_attempts {
            return RetryDecision::DeadLetter(DeadLetterReason::PoisonTask);
        }

        RetryDecision::RetryAfter(self.backoff(attempt))
    }

    /// Un-jittered delay before retry number `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Spreads `delay` by up to ±`jitter`, never exceeding the cap
    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = rng.gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + spread))
            .unwrap_or(self.max)
            .min(self.max)
    }
}
