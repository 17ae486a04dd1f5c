//! Per-target circuit breaker.
//!
//! # States
//!
//! 1. **Closed**: operations pass through, consecutive failures are counted.
//! 2. **Open**: operations are rejected without touching the provider until
//!    `open_until` passes.
//! 3. **HalfOpen**: up to `half_open_probe_budget` probe operations are admitted.
//!    A probe success closes the circuit; a probe failure reopens it with the
//!    cooldown doubled, up to `max_cooldown`.
//!
//! # State Transitions
//!
//! ```text
//! Closed   --failures >= threshold-->  Open
//! Closed   --TargetUnavailable------>  Open
//! Open     --now >= open_until------>  HalfOpen
//! HalfOpen --probe success---------->  Closed
//! HalfOpen --probe failure---------->  Open (cooldown * 2)
//! ```
//!
//! Each target owns one [`CircuitBreaker`] whose state sits behind its own
//! mutex, so targets never contend with each other and concurrent operations on
//! the same target serialize only on the counter update, never on provider I/O.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::tracker::epoch_ms;

/// Default consecutive failures before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default cooldown before an open circuit admits a probe.
pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;
/// Default ceiling for the doubled cooldown.
pub const DEFAULT_MAX_COOLDOWN_MS: u64 = 300_000;
/// Default number of concurrent half-open probes.
pub const DEFAULT_HALF_OPEN_PROBE_BUDGET: u32 = 1;
/// Longest a circuit can stay open in one stretch (one week).
pub const COOLDOWN_LIMIT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// The state of one target's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    #[default]
    Closed,
    /// Failing fast.
    Open,
    /// Admitting a bounded number of probes.
    HalfOpen,
}

/// Breaker thresholds and cooldowns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Initial time the circuit stays open.
    pub cooldown: Duration,
    /// Ceiling for the cooldown after repeated probe failures.
    pub max_cooldown: Duration,
    /// Probes admitted concurrently while half-open.
    pub half_open_probe_budget: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            max_cooldown: Duration::from_millis(DEFAULT_MAX_COOLDOWN_MS),
            half_open_probe_budget: DEFAULT_HALF_OPEN_PROBE_BUDGET,
        }
    }
}

/// Returned when the breaker refuses to admit an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{target}' is {state:?}, request rejected")]
pub struct BreakerRejection {
    /// The rejecting target.
    pub target: String,
    /// The state at the time of rejection.
    pub state: CircuitState,
    /// Time left until a probe may be admitted, when open.
    pub retry_in: Option<Duration>,
}

/// Point-in-time view of a breaker, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Target name.
    pub target: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive counted failures while closed.
    pub consecutive_failures: u32,
    /// Wall-clock time of the last counted failure (ms since epoch).
    pub last_failure_ms: Option<u64>,
    /// Time left until `open_until`, when open.
    pub open_remaining: Option<Duration>,
    /// Cooldown that the next trip will use.
    pub current_cooldown: Duration,
    /// Probes currently in flight.
    pub probes_in_flight: u32,
    /// Number of Closed/HalfOpen → Open transitions.
    pub trips: u64,
    /// Number of rejected admissions.
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_ms: Option<u64>,
    open_until: Option<Instant>,
    current_cooldown: Duration,
    probes_in_flight: u32,
    generation: u64,
    trips: u64,
    rejected: u64,
}

/// Circuit breaker guarding one target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `target`.
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_ms: None,
                open_until: None,
                current_cooldown,
                probes_in_flight: 0,
                generation: 0,
                trips: 0,
                rejected: 0,
            }),
        }
    }

    /// The guarded target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Asks to run one operation against the target.
    ///
    /// The returned permit must be resolved with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]; dropping it unresolved only frees its probe slot.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerRejection> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        let state = inner.state;
        let probe = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if inner.probes_in_flight < self.config.half_open_probe_budget => {
                inner.probes_in_flight += 1;
                debug!(
                    backend = %self.target,
                    probes_in_flight = inner.probes_in_flight,
                    "admitting half-open probe"
                );
                true
            }
            _ => {
                inner.rejected += 1;
                let retry_in = inner
                    .open_until
                    .map(|until| until.saturating_duration_since(Instant::now()));
                debug!(backend = %self.target, ?state, "circuit rejected request");
                return Err(BreakerRejection {
                    target: self.target.clone(),
                    state,
                    retry_in,
                });
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            generation: inner.generation,
            probe,
            resolved: false,
        })
    }

    /// Current state, applying the Open → HalfOpen transition if the cooldown elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// True while the circuit is open and the cooldown has not elapsed.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Consecutive counted failures.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Forces the circuit open with the current cooldown.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner, "manual trip");
    }

    /// Forces the circuit closed and clears all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
        info!(backend = %self.target, "circuit reset to closed");
    }

    /// Diagnostic snapshot.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_ms: inner.last_failure_ms,
            open_remaining: match inner.state {
                CircuitState::Open => inner
                    .open_until
                    .map(|until| until.saturating_duration_since(Instant::now())),
                _ => None,
            },
            current_cooldown: inner.current_cooldown,
            probes_in_flight: inner.probes_in_flight,
            trips: inner.trips,
            rejected: inner.rejected,
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .open_until
            .map(|until| Instant::now() >= until)
            .unwrap_or(true);
        if elapsed {
            inner.state = CircuitState::HalfOpen;
            inner.open_until = None;
            inner.probes_in_flight = 0;
            inner.generation += 1;
            info!(backend = %self.target, "circuit transitioned from open to half-open");
        }
    }

    fn open(&self, inner: &mut BreakerState, reason: &str) {
        let from = inner.state;
        inner.state = CircuitState::Open;
        let cooldown = inner.current_cooldown.min(Duration::from_millis(COOLDOWN_LIMIT_MS));
        inner.open_until = Some(Instant::now() + cooldown);
        inner.probes_in_flight = 0;
        inner.generation += 1;
        inner.trips += 1;
        warn!(
            backend = %self.target,
            ?from,
            reason,
            failures = inner.consecutive_failures,
            cooldown_ms = inner.current_cooldown.as_millis() as u64,
            "circuit opened"
        );
    }

    fn close(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.current_cooldown = self.config.cooldown;
        inner.probes_in_flight = 0;
        inner.generation += 1;
    }

    fn on_success(&self, generation: u64, probe: bool) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            debug!(backend = %self.target, "ignoring stale success");
            return;
        }
        let state = inner.state;
        match state {
            CircuitState::HalfOpen if probe => {
                self.close(&mut inner);
                info!(backend = %self.target, "probe succeeded, circuit closed");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64, probe: bool, kind: ErrorKind) {
        let mut inner = self.inner.lock();
        if probe && inner.generation == generation {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        if !kind.counts_against_target() {
            debug!(backend = %self.target, %kind, "failure not counted against target");
            return;
        }
        inner.last_failure_ms = Some(epoch_ms());
        if generation != inner.generation {
            debug!(backend = %self.target, "ignoring stale failure");
            return;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if kind == ErrorKind::TargetUnavailable {
                    self.open(&mut inner, "target unavailable");
                } else if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner, "failure threshold reached");
                } else {
                    debug!(
                        backend = %self.target,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "recorded failure"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.current_cooldown =
                    inner.current_cooldown.saturating_mul(2).min(self.config.max_cooldown);
                self.open(&mut inner, "probe failed");
            }
            _ => {}
        }
    }

    fn on_release(&self, generation: u64, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

/// Admission ticket for one operation against a target.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this permit is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The target this permit was issued for.
    pub fn target(&self) -> &str {
        self.breaker.target()
    }

    /// Reports success; closes a half-open circuit.
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.generation, self.probe);
    }

    /// Reports a failure of the given kind.
    pub fn failure(mut self, kind: ErrorKind) {
        self.resolved = true;
        self.breaker.on_failure(self.generation, self.probe, kind);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_release(self.generation, self.probe);
        }
    }
}

/// Registry mapping target names to breakers, created lazily on first use.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    overrides: DashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers use `default_config`.
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Uses `config` for `target` instead of the default. Only affects breakers
    /// created after this call.
    pub fn set_target_config(&self, target: &str, config: BreakerConfig) {
        self.overrides.insert(target.to_string(), config);
    }

    /// Returns the breaker for `target`, creating it if needed.
    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(target.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(target)
                .map(|c| c.value().clone())
                .unwrap_or_else(|| self.default_config.clone());
            debug!(backend = target, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(target, config))
        });
        Arc::clone(entry.value())
    }

    /// Returns the breaker for `target` if one exists.
    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    /// True if `target` has a breaker and it is currently open.
    pub fn is_open(&self, target: &str) -> bool {
        self.get(target).map(|b| b.is_open()).unwrap_or(false)
    }

    /// Snapshots of every known breaker, sorted by target.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    /// Resets every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }

    /// Number of breakers created so far.
    pub fn count(&self) -> usize {
        self.breakers.len()
    }
}
