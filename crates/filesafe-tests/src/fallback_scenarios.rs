//! Fallback Routing Scenarios
//!
//! primary -> secondary -> local-cache chains, with the last tier on local disk.
