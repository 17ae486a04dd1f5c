//! Property-based tests of the recovery manager over scripted failures.
