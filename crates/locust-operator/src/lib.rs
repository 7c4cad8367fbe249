//! Locust operator - wiring for the LocustTest controller
//!
//! The reconcile logic lives in `locust-run`; this crate turns command line
//! configuration into a running controller, stats daemons and health server.

pub mod config;
pub mod controller_runner;
pub mod health;
pub mod startup;
