//! Error Tracker Degradation Tests
//!
//! A broken error sink never fails the wrapped operation; it is reported as
//! degraded observability instead.
