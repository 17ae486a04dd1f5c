//! Configuration surface for the recovery subsystem.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuitbreaker::{
    BreakerConfig, COOLDOWN_LIMIT_MS, DEFAULT_COOLDOWN_MS, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HALF_OPEN_PROBE_BUDGET, DEFAULT_MAX_COOLDOWN_MS,
};
use crate::error::{ConfigError, ErrorKind};
use crate::fallback::FallbackRouter;
use crate::journal::{JournalConfig, DEFAULT_ARCHIVE_CAPACITY, DEFAULT_COMPENSATION_TIMEOUT_MS};
use crate::retry::{
    default_retryable_kinds, RetryConfig, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_FRACTION,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_MULTIPLIER,
    DEFAULT_RATE_LIMIT_BACKOFF_FACTOR,
};
use crate::tracker::{
    TrackerConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_TIMEOUT_MS, DEFAULT_HISTORY_CAPACITY,
};

/// Default per-attempt deadline for provider calls.
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;

/// How the attempt budget behaves when an operation is rerouted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerouteBudget {
    /// Each target gets the full `max_attempts`.
    #[default]
    PerTarget,
    /// `max_attempts` is shared by every target the operation visits.
    Shared,
}

/// Named options, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    /// Attempts per target, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Backoff growth factor.
    pub multiplier: f64,
    /// Cap on one retry delay.
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction.
    pub jitter_fraction: f64,
    /// Consecutive failures that open a breaker.
    pub failure_threshold: u32,
    /// Initial breaker cooldown.
    pub cooldown_ms: u64,
    /// Concurrent half-open probes.
    pub half_open_probe_budget: u32,
    /// Ceiling for the doubled breaker cooldown.
    pub max_cooldown_ms: u64,
    /// Deadline for one provider call.
    pub attempt_timeout_ms: u64,
    /// Extra backoff factor for rate-limited failures.
    pub rate_limit_backoff_factor: f64,
    /// Kinds that may be retried.
    pub retryable_kinds: BTreeSet<ErrorKind>,
    /// Attempt budget across reroutes.
    pub reroute_budget: RerouteBudget,
    /// Bound on one error sink write.
    pub tracker_flush_timeout_ms: u64,
    /// Error records kept for local queries.
    pub tracker_history_capacity: usize,
    /// Error records buffered while the sink is failing.
    pub tracker_buffer_capacity: usize,
    /// Terminal journal entries kept.
    pub journal_archive_capacity: usize,
    /// Deadline for one compensating action.
    pub compensation_timeout_ms: u64,
    /// Ordered fallback targets per storage class.
    pub fallback_chains: BTreeMap<String, Vec<String>>,
    /// Explicit storage class per target.
    pub target_classes: BTreeMap<String, String>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            half_open_probe_budget: DEFAULT_HALF_OPEN_PROBE_BUDGET,
            max_cooldown_ms: DEFAULT_MAX_COOLDOWN_MS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            rate_limit_backoff_factor: DEFAULT_RATE_LIMIT_BACKOFF_FACTOR,
            retryable_kinds: default_retryable_kinds(),
            reroute_budget: RerouteBudget::default(),
            tracker_flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            tracker_history_capacity: DEFAULT_HISTORY_CAPACITY,
            tracker_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            journal_archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            compensation_timeout_ms: DEFAULT_COMPENSATION_TIMEOUT_MS,
            fallback_chains: BTreeMap::new(),
            target_classes: BTreeMap::new(),
        }
    }
}

impl RecoveryOptions {
    /// Loads options from a `.toml` or `.json` file and validates them.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let options: RecoveryOptions = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };
        options.validate()?;
        Ok(options)
    }

    /// Rejects values outside their permitted ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("multiplier", "must be a finite value >= 1.0"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid("base_delay_ms", "must not exceed max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(invalid("jitter_fraction", "must be within [0, 1]"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if self.cooldown_ms == 0 {
            return Err(invalid("cooldown_ms", "must be positive"));
        }
        if self.max_cooldown_ms < self.cooldown_ms {
            return Err(invalid("max_cooldown_ms", "must be >= cooldown_ms"));
        }
        if self.max_cooldown_ms > COOLDOWN_LIMIT_MS {
            return Err(invalid(
                "max_cooldown_ms",
                format!("must not exceed {COOLDOWN_LIMIT_MS} ms"),
            ));
        }
        if self.half_open_probe_budget == 0 {
            return Err(invalid("half_open_probe_budget", "must be at least 1"));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(invalid("attempt_timeout_ms", "must be positive"));
        }
        if !self.rate_limit_backoff_factor.is_finite() || self.rate_limit_backoff_factor < 1.0 {
            return Err(invalid(
                "rate_limit_backoff_factor",
                "must be a finite value >= 1.0",
            ));
        }
        if let Some(kind) = self.retryable_kinds.iter().find(|k| k.is_permanent()) {
            return Err(invalid(
                "retryable_kinds",
                format!("{kind} failures can never be retried"),
            ));
        }
        if self.tracker_flush_timeout_ms == 0 {
            return Err(invalid("tracker_flush_timeout_ms", "must be positive"));
        }
        if self.compensation_timeout_ms == 0 {
            return Err(invalid("compensation_timeout_ms", "must be positive"));
        }
        for (class, chain) in &self.fallback_chains {
            if chain.is_empty() {
                return Err(invalid("fallback_chains", format!("chain '{class}' is empty")));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = chain.iter().find(|t| !seen.insert(t.as_str())) {
                return Err(invalid(
                    "fallback_chains",
                    format!("chain '{class}' lists '{dup}' twice"),
                ));
            }
        }
        for (target, class) in &self.target_classes {
            if !self.fallback_chains.contains_key(class) {
                return Err(invalid(
                    "target_classes",
                    format!("target '{target}' refers to unknown class '{class}'"),
                ));
            }
        }
        Ok(())
    }

    /// Retry settings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_fraction: self.jitter_fraction,
            rate_limit_backoff_factor: self.rate_limit_backoff_factor,
            retryable_kinds: self.retryable_kinds.clone(),
        }
    }

    /// Breaker settings.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            max_cooldown: Duration::from_millis(self.max_cooldown_ms),
            half_open_probe_budget: self.half_open_probe_budget,
        }
    }

    /// Tracker settings.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            flush_timeout: Duration::from_millis(self.tracker_flush_timeout_ms),
            history_capacity: self.tracker_history_capacity,
            buffer_capacity: self.tracker_buffer_capacity,
        }
    }

    /// Journal settings.
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            archive_capacity: self.journal_archive_capacity,
            compensation_timeout: Duration::from_millis(self.compensation_timeout_ms),
        }
    }

    /// Builds the fallback router from the configured chains.
    pub fn fallback_router(&self) -> FallbackRouter {
        let router = self
            .fallback_chains
            .iter()
            .fold(FallbackRouter::new(), |router, (class, chain)| {
                router.with_chain(class.clone(), chain.iter().cloned())
            });
        self.target_classes
            .iter()
            .fold(router, |router, (target, class)| {
                router.with_target_class(target.clone(), class.clone())
            })
    }

    /// Deadline for one provider call.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}
