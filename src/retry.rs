// src/retry.rs

//! Retry/backoff policy.
//!
//! A pure decision over `(error kind, attempts made, max attempts)`. The only
//! impure bit is the jitter sample, which [`RetryPolicy::decide`] draws from
//! `rand::thread_rng()`; [`RetryPolicy::decide_with_jitter`] takes it as an
//! argument so tests and the property suite stay deterministic.

use std::time::Duration;

use rand::Rng;

use crate::types::{ErrorClass, ErrorKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue and wait at least `delay` before the next admission.
    Retry { delay: Duration },
    /// Give up; the session becomes Failed.
    Exhausted,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Exponential backoff with a cap and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the capped delay added as random jitter, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// `attempts_made` includes the attempt that just failed (1-based).
    pub fn decide(&self, kind: ErrorKind, attempts_made: u32, max_attempts: u32) -> RetryDecision {
        let sample: f64 = rand::thread_rng().r#gen();
        self.decide_with_jitter(kind, attempts_made, max_attempts, sample)
    }

    /// Same as [`decide`](Self::decide) with an explicit jitter sample in `[0, 1)`.
    pub fn decide_with_jitter(
        &self,
        kind: ErrorKind,
        attempts_made: u32,
        max_attempts: u32,
        sample: f64,
    ) -> RetryDecision {
        if kind.class() != ErrorClass::Transient || attempts_made >= max_attempts {
            return RetryDecision::Exhausted;
        }
        // Exponent is the zero-based index of the retry about to happen.
        let exponent = attempts_made.saturating_sub(1);
        RetryDecision::Retry {
            delay: self.backoff(exponent, sample),
        }
    }

    /// `min(cap, base * 2^exponent) * (1 + jitter * sample)`, never zero.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff(&self, exponent: u32, sample: f64) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);

        let exponential = base_ms.saturating_mul(1u64 << exponent.min(31));
        let capped = exponential.min(cap_ms);

        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        let with_jitter = (capped as f64) * (1.0 + jitter);

        Duration::from_millis((with_jitter.round() as u64).max(1))
    }
}
