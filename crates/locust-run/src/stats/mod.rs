//! Live telemetry for running LocustTests
//!
//! One daemon per LocustTest polls the master's `/stats/requests` endpoint
//! and merges the result into the status subresource. Failures back off
//! exponentially from a floor up to thirty times that floor; successful
//! cycles wait out the poll interval with bounded jitter.

mod daemon;
mod fetch;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use locust_common::crd::LocustTestStatus;

use crate::compiler::{web_service_name, RunInstance};
use crate::error::TelemetryFetchError;

pub use daemon::{run_stats_loop, StatsDaemons};
pub use fetch::{
    build_fetcher, DirectStatsFetcher, ProxyStatsFetcher, StatsAccess, StatsFetcher,
    STATS_PATH,
};

#[cfg(test)]
pub use fetch::MockStatsFetcher;

/// Upper bound on the jitter fraction
pub const MAX_JITTER: f64 = 0.2;

/// Ceiling of the failure backoff as a multiple of its floor
pub const BACKOFF_CEILING_FACTOR: u32 = 30;

/// Stats snapshot as served by the Locust master
///
/// Locust returns many more keys; only these are read and all of them must
/// be present with the right types.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub state: String,
    pub fail_ratio: f64,
    pub total_rps: f64,
    pub user_count: i64,
    pub worker_count: i64,
}

/// Decode a `/stats/requests` response body
pub fn decode_snapshot(body: &str) -> Result<StatsSnapshot, TelemetryFetchError> {
    Ok(serde_json::from_str(body)?)
}

impl StatsSnapshot {
    /// Status fields owned by the stats daemon
    pub fn to_status(&self, expected_workers: i32, now: DateTime<Utc>) -> LocustTestStatus {
        LocustTestStatus {
            state: Some(self.state.to_uppercase()),
            fail_ratio: Some(format!("{}%", (self.fail_ratio * 100.0).round() as i64)),
            total_rps: Some(self.total_rps.round() as i64),
            user_count: Some(self.user_count),
            worker_count: Some(self.worker_count),
            worker_ratio: Some(format!("{}/{}", self.worker_count, expected_workers)),
            last_updated: Some(now),
            ..Default::default()
        }
    }
}

/// What a stats daemon polls; replaced in place when the spec changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsTarget {
    /// LocustTest namespace
    pub namespace: String,
    /// LocustTest name
    pub run: String,
    /// Web service serving the stats endpoint
    pub service: String,
    /// Web port
    pub port: u16,
    /// Denominator of `worker_ratio`
    pub expected_workers: i32,
}

impl StatsTarget {
    pub fn new(instance: &RunInstance, port: u16, expected_workers: i32) -> Self {
        Self {
            namespace: instance.namespace.clone(),
            run: instance.name.clone(),
            service: web_service_name(&instance.name),
            port,
            expected_workers,
        }
    }

    /// Registry key, `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.run)
    }
}

/// Timing of the stats daemons
#[derive(Clone, Debug, PartialEq)]
pub struct StatsConfig {
    /// Poll interval
    pub interval: Duration,
    /// First failure delay
    pub backoff_floor: Duration,
    /// Wait before the first fetch
    pub initial_delay: Duration,
    /// Jitter as a fraction of `interval`, at most [`MAX_JITTER`]
    pub jitter: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            backoff_floor: Duration::from_secs(1),
            initial_delay: Duration::from_secs(5),
            jitter: MAX_JITTER,
        }
    }
}

impl StatsConfig {
    /// Set the jitter fraction, clamped to `0..=MAX_JITTER`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };
        self
    }
}

/// Exponential failure backoff, doubled per failure and reset on success
#[derive(Clone, Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration) -> Self {
        Self {
            floor,
            ceiling: floor.saturating_mul(BACKOFF_CEILING_FACTOR),
            current: floor,
        }
    }

    /// Delay for this failure, capped at `interval`; advances the backoff
    pub fn next_delay(&mut self, interval: Duration) -> Duration {
        let delay = self.current.min(interval);
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Wait after a successful cycle: `max(0, interval - elapsed ± jitter)`
///
/// `offset` is a sample in `-1.0..=1.0` scaling the jitter fraction.
pub fn jittered_wait(interval: Duration, elapsed: Duration, jitter: f64, offset: f64) -> Duration {
    let jitter = jitter.clamp(0.0, MAX_JITTER) * offset.clamp(-1.0, 1.0);
    let remaining = interval.saturating_sub(elapsed).as_secs_f64();
    let wait = remaining + jitter * interval.as_secs_f64();
    Duration::try_from_secs_f64(wait.max(0.0)).unwrap_or(Duration::MAX)
}
