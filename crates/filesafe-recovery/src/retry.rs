//! Retry policy with exponential backoff and jitter.
//!
//! [`RetryPolicy::decide`] is a pure decision function: given the kind of the
//! failure that just happened and the number of the attempt that produced it,
//! it says whether to try again and how long to wait first. It holds no state,
//! so one policy value can serve any number of concurrent operations.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
/// Default jitter fraction (±10%).
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;
/// Default extra factor applied to rate-limited delays.
pub const DEFAULT_RATE_LIMIT_BACKOFF_FACTOR: f64 = 2.0;

/// Per operation-class retry configuration.
///
/// Immutable once built; the manager clones it into each operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts on one target, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Uniform jitter applied as `delay * (1 ± jitter_fraction)`.
    pub jitter_fraction: f64,
    /// Extra multiplier for [`ErrorKind::RateLimited`] delays, applied before the cap.
    pub rate_limit_backoff_factor: f64,
    /// Kinds that may be retried. Permanent kinds are ignored even if listed.
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            rate_limit_backoff_factor: DEFAULT_RATE_LIMIT_BACKOFF_FACTOR,
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `kind` may be retried under this config.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        !kind.is_permanent() && self.retryable_kinds.contains(&kind)
    }
}

/// The retryable kinds used when none are configured.
pub fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    [ErrorKind::Transient, ErrorKind::RateLimited]
        .into_iter()
        .collect()
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub retry: bool,
    /// How long to wait before that attempt. Zero when `retry` is false.
    pub delay: Duration,
}

impl RetryDecision {
    /// Give up.
    pub const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Stateless retry decision function.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Decides whether attempt `attempt + 1` should happen after `attempt`
    /// failed with `kind`.
    ///
    /// `attempt` is 1-based. Retries only if the kind is retryable and
    /// `attempt < config.max_attempts`.
    pub fn decide(kind: ErrorKind, attempt: u32, config: &RetryConfig) -> RetryDecision {
        Self::decide_with_hint(kind, attempt, config, None)
    }

    /// Like [`RetryPolicy::decide`], honouring a provider `retry_after` hint.
    ///
    /// The hint raises the delay but never past `config.max_delay`.
    pub fn decide_with_hint(
        kind: ErrorKind,
        attempt: u32,
        config: &RetryConfig,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !config.is_retryable(kind) || attempt >= config.max_attempts {
            return RetryDecision::STOP;
        }

        let mut delay = backoff_delay(kind, attempt, config);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(config.max_delay));
        }
        RetryDecision::after(delay)
    }
}

/// Computes `min(base * multiplier^(attempt-1), max)` with jitter applied.
pub fn backoff_delay(kind: ErrorKind, attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let mut delay_ms = config.base_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    if kind == ErrorKind::RateLimited {
        delay_ms *= config.rate_limit_backoff_factor;
    }
    let max_ms = config.max_delay.as_millis() as f64;
    let capped = if delay_ms.is_finite() {
        delay_ms.min(max_ms)
    } else {
        max_ms
    };

    let jittered = apply_jitter(capped, config.jitter_fraction);
    Duration::from_millis(jittered.round().max(0.0) as u64)
}

fn apply_jitter(delay_ms: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 || delay_ms <= 0.0 {
        return delay_ms;
    }
    let fraction = fraction.min(1.0);
    let factor = rand::thread_rng().gen_range(-fraction..=fraction);
    delay_ms * (1.0 + factor)
}
