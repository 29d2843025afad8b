//! # Module: govern
//!
//! The proposal-to-configuration half of the loop.
//!
//! ## Sub-modules
//! - [`policy`] — rate limits, hard bounds, regression thresholds
//! - [`version`] — the single-writer versioned configuration store
//! - [`engine`] — the validate/apply/observe/commit-or-rollback machine
//! - [`audit`] — terminal-transition records and sinks

pub mod audit;
pub mod engine;
pub mod policy;
pub mod version;
