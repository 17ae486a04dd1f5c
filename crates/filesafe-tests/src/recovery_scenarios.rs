//! Recovery Scenarios
//!
//! End-to-end behaviour of the recovery manager: retry delays, breaker trips,
//! rollback order and journal state rules.
