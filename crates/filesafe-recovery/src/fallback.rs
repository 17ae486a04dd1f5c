//! Fallback routing across ordered storage chains.
//!
//! Each logical storage class owns an ordered chain of targets, for example
//! `primary -> secondary -> local-cache`. When a target is unavailable the
//! router hands out the next target in its chain that the operation has not
//! tried yet and whose breaker is not open. It never goes back to a target
//! the operation already tried, so a reroute sequence always terminates.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circuitbreaker::BreakerRegistry;
use crate::error::ErrorKind;
use crate::tracker::epoch_ms;

const MAX_EVENTS: usize = 1024;

/// A reroute decision, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerouteEvent {
    /// Target that failed.
    pub from: String,
    /// Target chosen, or `None` if the chain was exhausted.
    pub to: Option<String>,
    /// Classification that triggered routing.
    pub kind: ErrorKind,
    /// Whether the failed target's breaker was open.
    pub circuit_open: bool,
    /// Wall-clock time (ms since epoch).
    pub timestamp_ms: u64,
}

/// Ordered fallback chains per storage class.
#[derive(Debug, Default)]
pub struct FallbackRouter {
    chains: BTreeMap<String, Vec<String>>,
    target_classes: HashMap<String, String>,
    events: Mutex<VecDeque<RerouteEvent>>,
    reroutes: Mutex<BTreeMap<String, u64>>,
}

impl FallbackRouter {
    /// A router with no chains; every route returns `None`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the chain for `class`. Duplicate targets keep their first position.
    pub fn with_chain<I, S>(mut self, class: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let chain: Vec<String> = targets
            .into_iter()
            .map(Into::into)
            .filter(|t| seen.insert(t.clone()))
            .collect();
        self.chains.insert(class.into(), chain);
        self
    }

    /// Pins `target` to `class`. Targets not pinned belong to the first chain
    /// that lists them.
    pub fn with_target_class(mut self, target: impl Into<String>, class: impl Into<String>) -> Self {
        self.target_classes.insert(target.into(), class.into());
        self
    }

    /// The storage class of `target`, if any.
    pub fn class_of(&self, target: &str) -> Option<&str> {
        if let Some(class) = self.target_classes.get(target) {
            return Some(class.as_str());
        }
        self.chains
            .iter()
            .find(|(_, chain)| chain.iter().any(|t| t == target))
            .map(|(class, _)| class.as_str())
    }

    /// The chain `target` belongs to.
    pub fn chain_for(&self, target: &str) -> Option<&[String]> {
        self.class_of(target)
            .and_then(|class| self.chains.get(class))
            .map(Vec::as_slice)
    }

    /// Whether routing applies to a failure of `kind` on `target`.
    pub fn should_route(&self, target: &str, kind: ErrorKind, breakers: &BreakerRegistry) -> bool {
        !kind.is_permanent()
            && (kind == ErrorKind::TargetUnavailable || breakers.is_open(target))
    }

    /// Picks the next target after a failure of `kind` on `target`.
    ///
    /// Returns `None` when routing does not apply (permanent kinds, or a
    /// healthy target failing with a non-availability error) or when every
    /// remaining target in the chain was tried or has an open breaker.
    pub fn route(
        &self,
        target: &str,
        kind: ErrorKind,
        tried: &HashSet<String>,
        breakers: &BreakerRegistry,
    ) -> Option<String> {
        if !self.should_route(target, kind, breakers) {
            debug!(backend = target, %kind, "fallback routing not applicable");
            return None;
        }
        let circuit_open = breakers.is_open(target);
        let next = self.chain_for(target).and_then(|chain| {
            chain
                .iter()
                .filter(|t| t.as_str() != target && !tried.contains(t.as_str()))
                .find(|t| !breakers.is_open(t))
                .cloned()
        });

        match &next {
            Some(to) => {
                *self.reroutes.lock().entry(target.to_string()).or_insert(0) += 1;
                info!(from = target, to = %to, %kind, circuit_open, "rerouting to fallback target");
            }
            None => debug!(backend = target, %kind, "fallback chain exhausted"),
        }
        self.push_event(RerouteEvent {
            from: target.to_string(),
            to: next.clone(),
            kind,
            circuit_open,
            timestamp_ms: epoch_ms(),
        });
        next
    }

    /// Removes and returns recorded routing decisions, oldest first.
    pub fn drain_events(&self) -> Vec<RerouteEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Successful reroutes away from each target.
    pub fn reroute_counts(&self) -> BTreeMap<String, u64> {
        self.reroutes.lock().clone()
    }

    /// Configured chains by class.
    pub fn chains(&self) -> &BTreeMap<String, Vec<String>> {
        &self.chains
    }

    fn push_event(&self, event: RerouteEvent) {
        let mut events = self.events.lock();
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }
}
