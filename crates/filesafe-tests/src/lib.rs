//! filesafe test and validation infrastructure.
//!
//! The [`harness`] module builds a recovery manager over scripted in-memory
//! providers; the remaining modules are scenario suites run with `cargo test`.

pub mod harness;

pub mod breaker_scenarios;
pub mod cancellation_tests;
pub mod durability_tests;
pub mod fallback_scenarios;
pub mod proptest_manager;
pub mod recovery_scenarios;
pub mod tracker_degradation;

pub use harness::{CompensationLog, FailingSink, Scenario, ScenarioBuilder, StuckSink, TestEnv};
