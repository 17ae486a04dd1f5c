//! Circuit Breaker Scenarios
//!
//! Breaker behaviour as seen through the recovery manager, on tokio's paused clock.
