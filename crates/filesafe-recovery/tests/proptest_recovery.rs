//! Property-based tests for filesafe-recovery using proptest.
//!
//! These check invariants of the retry policy, circuit breaker, journal and
//! fallback router over generated inputs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use filesafe_recovery::{
    circuitbreaker::{BreakerConfig, CircuitBreaker, CircuitState},
    compensation_fn,
    error::ErrorKind,
    fallback::FallbackRouter,
    journal::{OperationLog, StepDescriptor},
    metadata::FileMetadata,
    retry::{backoff_delay, RetryConfig, RetryPolicy},
    BreakerRegistry,
};
use parking_lot::Mutex;
use proptest::prelude::*;

fn any_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Transient),
        Just(ErrorKind::RateLimited),
        Just(ErrorKind::TargetUnavailable),
        Just(ErrorKind::Permanent),
        Just(ErrorKind::Internal),
    ]
}

fn any_retry_config() -> impl Strategy<Value = RetryConfig> {
    (1u32..10, 1u64..1_000, 1.0f64..4.0, 0u64..60_000, 0.0f64..=1.0).prop_map(
        |(max_attempts, base, multiplier, extra, jitter)| RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(base),
            multiplier,
            max_delay: Duration::from_millis(base + extra),
            jitter_fraction: jitter,
            ..RetryConfig::default()
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// Permanent and Internal failures are never retried, whatever the config says.
    #[test]
    fn test_permanent_kinds_never_retried(config in any_retry_config(), attempt in 1u32..20) {
        prop_assert!(!RetryPolicy::decide(ErrorKind::Permanent, attempt, &config).retry);
        prop_assert!(!RetryPolicy::decide(ErrorKind::Internal, attempt, &config).retry);
    }

    /// No retry is granted once the attempt budget is spent.
    #[test]
    fn test_attempt_budget_respected(
        config in any_retry_config(),
        kind in any_kind(),
        over in 0u32..10,
    ) {
        let attempt = config.max_attempts + over;
        prop_assert!(!RetryPolicy::decide(kind, attempt, &config).retry);
    }

    /// Jittered delays stay within the jitter band around the capped delay.
    #[test]
    fn test_delay_within_jitter_band(config in any_retry_config(), attempt in 1u32..40) {
        let delay = backoff_delay(ErrorKind::Transient, attempt, &config);
        let ceiling = config.max_delay.as_millis() as f64 * (1.0 + config.jitter_fraction);
        prop_assert!(delay.as_millis() as f64 <= ceiling.ceil());
    }

    /// Without jitter, delays never shrink and never exceed the cap.
    #[test]
    fn test_delays_monotonic_without_jitter(config in any_retry_config(), attempt in 1u32..30) {
        let config = RetryConfig { jitter_fraction: 0.0, ..config };
        let a = backoff_delay(ErrorKind::Transient, attempt, &config);
        let b = backoff_delay(ErrorKind::Transient, attempt + 1, &config);
        prop_assert!(a <= b);
        prop_assert!(b <= config.max_delay);
    }

    /// A retry-after hint lifts the delay but never past the cap.
    #[test]
    fn test_hint_capped(config in any_retry_config(), hint_ms in 0u64..1_000_000) {
        prop_assume!(config.max_attempts > 1);
        let config = RetryConfig { jitter_fraction: 0.0, ..config };
        let decision = RetryPolicy::decide_with_hint(
            ErrorKind::Transient,
            1,
            &config,
            Some(Duration::from_millis(hint_ms)),
        );
        prop_assert!(decision.retry);
        prop_assert!(decision.delay <= config.max_delay);
        prop_assert!(decision.delay >= Duration::from_millis(hint_ms).min(config.max_delay));
    }

    /// The breaker opens exactly when the consecutive transient failure count
    /// reaches the threshold, and rejects everything afterwards.
    #[test]
    fn test_breaker_matches_consecutive_failure_model(
        threshold in 1u32..6,
        outcomes in proptest::collection::vec(any::<bool>(), 0..40),
    ) {
        let breaker = Arc::new(CircuitBreaker::new("primary", BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(3600),
            max_cooldown: Duration::from_secs(3600),
            ..BreakerConfig::default()
        }));

        let mut consecutive = 0u32;
        let mut open = false;
        for ok in outcomes {
            match breaker.try_acquire() {
                Ok(permit) => {
                    prop_assert!(!open);
                    if ok {
                        permit.success();
                        consecutive = 0;
                    } else {
                        permit.failure(ErrorKind::Transient);
                        consecutive += 1;
                        open = consecutive >= threshold;
                    }
                }
                Err(rejection) => {
                    prop_assert!(open);
                    prop_assert_eq!(rejection.state, CircuitState::Open);
                }
            }
        }
        prop_assert_eq!(breaker.is_open(), open);
    }

    /// Failures that say nothing about target health never open the breaker.
    #[test]
    fn test_permanent_failures_never_trip(count in 1usize..50) {
        let breaker = Arc::new(CircuitBreaker::new("primary", BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        }));
        for i in 0..count {
            let kind = if i % 2 == 0 { ErrorKind::Permanent } else { ErrorKind::Internal };
            breaker.try_acquire().unwrap().failure(kind);
        }
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Rollback compensates every recorded step exactly once, newest first.
    #[test]
    fn test_rollback_reverses_recording_order(steps in 0usize..12) {
        let order = runtime().block_on(async {
            let log = OperationLog::default();
            let handle = log.begin("op", FileMetadata::for_content("f", b"x")).unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            for i in 0..steps {
                let seen = Arc::clone(&seen);
                log.record_step(
                    &handle,
                    StepDescriptor::new(format!("step-{i}"), "primary"),
                    compensation_fn(move || {
                        let seen = Arc::clone(&seen);
                        async move {
                            seen.lock().push(i);
                            Ok(())
                        }
                    }),
                )
                .unwrap();
            }
            let result = log.rollback(&handle).await.unwrap();
            assert_eq!(result.compensated.len(), steps);
            let order = seen.lock().clone();
            order
        });
        let expected: Vec<usize> = (0..steps).rev().collect();
        prop_assert_eq!(order, expected);
    }

    /// The router never hands back a tried target and always stays in the chain.
    #[test]
    fn test_router_never_revisits(
        chain_len in 1usize..8,
        tried_mask in any::<u8>(),
        open_mask in any::<u8>(),
    ) {
        let chain: Vec<String> = (0..chain_len).map(|i| format!("t{i}")).collect();
        let router = FallbackRouter::new().with_chain("class", chain.clone());
        let breakers = BreakerRegistry::new(BreakerConfig {
            cooldown: Duration::from_secs(3600),
            max_cooldown: Duration::from_secs(3600),
            ..BreakerConfig::default()
        });
        let mut tried: HashSet<String> = HashSet::new();
        tried.insert(chain[0].clone());
        for (i, target) in chain.iter().enumerate() {
            if tried_mask & (1 << i) != 0 {
                tried.insert(target.clone());
            }
            if open_mask & (1 << i) != 0 {
                breakers.get_or_create(target).trip();
            }
        }

        let mut from = chain[0].clone();
        let mut hops = 0;
        while let Some(next) = router.route(&from, ErrorKind::TargetUnavailable, &tried, &breakers) {
            prop_assert!(chain.contains(&next));
            prop_assert!(!tried.contains(&next));
            prop_assert!(!breakers.is_open(&next));
            tried.insert(next.clone());
            from = next;
            hops += 1;
            prop_assert!(hops <= chain_len);
        }
    }
}
