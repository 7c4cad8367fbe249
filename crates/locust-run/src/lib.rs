//! LocustTest reconciliation engine
//!
//! - `compiler`: pure mapping from a validated [`RunSpec`](locust_common::crd::RunSpec)
//!   to the ConfigMap, Services and Deployments of one run
//! - `classifier`: decides whether a spec change forces a master/worker restart
//! - `controller`: idempotent create-or-update convergence plus the kube-rs adapter
//! - `stats`: per-run daemon mirroring Locust telemetry onto the status

pub mod classifier;
pub mod client;
pub mod compiler;
pub mod controller;
pub mod error;
pub mod stats;

pub use error::{RunError, TelemetryFetchError};
