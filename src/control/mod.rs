//! # Module: control
//!
//! The measurement-to-proposal half of the loop.
//!
//! ## Sub-modules
//! - [`pid`] — the control law: bounded, anti-windup, deterministic
//! - [`driver`] — per-target sampling cadence and tick lifecycle
//! - [`decider`] — signal → discrete patch proposals with dead-band and
//!   in-flight gating

pub mod decider;
pub mod driver;
pub mod pid;
