//! Retry policy for failed download attempts
//!
//! Pure decision logic: given how many attempts have failed, the attempt
//! ceiling and the failure class, decide whether to retry and after how long.
//! Exponential backoff with jitter, capped at a configured maximum; a larger
//! server `Retry-After` hint wins, up to the same maximum.

use std::time::Duration;

use rand::{Rng, thread_rng};

use crate::config::RetryPolicyConfig;
use crate::models::download_job::FailureClass;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_seconds: f64,
    max_seconds: f64,
    max_delay: Duration,
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryPolicyConfig) -> Self {
        Self {
            base_seconds: config.base_seconds as f64,
            max_seconds: config.max_seconds as f64,
            max_delay: Duration::from_secs(config.max_seconds),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Decide whether a job whose `failed_attempts`-th attempt just failed
    /// should be retried automatically.
    pub fn should_retry(
        &self,
        failed_attempts: i32,
        max_attempts: i32,
        class: FailureClass,
        retry_after_hint: Option<Duration>,
    ) -> RetryDecision {
        self.should_retry_with_rng(
            failed_attempts,
            max_attempts,
            class,
            retry_after_hint,
            &mut thread_rng(),
        )
    }

    pub fn should_retry_with_rng<R: Rng + ?Sized>(
        &self,
        failed_attempts: i32,
        max_attempts: i32,
        class: FailureClass,
        retry_after_hint: Option<Duration>,
        rng: &mut R,
    ) -> RetryDecision {
        if !class.is_retryable() || failed_attempts >= max_attempts {
            return RetryDecision::give_up();
        }

        RetryDecision {
            retry: true,
            delay: self.backoff_duration(failed_attempts, retry_after_hint, rng),
        }
    }

    /// `min(base * 2^(failed_attempts - 1), max)`, raised to `min(hint, max)`
    /// if that is larger, plus up to `jitter_factor` of the result.
    pub fn backoff_duration<R: Rng + ?Sized>(
        &self,
        failed_attempts: i32,
        retry_after_hint: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).clamp(0, 32);
        let mut backoff = (self.base_seconds * 2_f64.powi(exponent)).min(self.max_seconds);

        if let Some(hint) = retry_after_hint {
            backoff = backoff.max(hint.as_secs_f64().min(self.max_seconds));
        }

        let jitter_span = self.jitter_factor * backoff;
        let jitter = if jitter_span > 0.0 {
            rng.gen_range(0.0..jitter_span)
        } else {
            0.0
        };

        Duration::try_from_secs_f64(backoff + jitter)
            .unwrap_or(self.max_delay)
    }
}
