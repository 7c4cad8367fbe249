//! Command line and environment configuration

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use locust_common::telemetry::{LogFormat, LoggingConfig};
use locust_run::stats::{StatsAccess, StatsConfig};

/// Locust operator - runs distributed Locust load tests on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "locust-operator", version, about, long_about = None)]
pub struct Cli {
    /// Generate the LocustTest CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    #[command(flatten)]
    pub operator: OperatorArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Only watch LocustTests in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds between stats polls
    #[arg(long, env = "STATS_INTERVAL", default_value_t = 10)]
    pub stats_interval: u64,

    /// Seconds of the first retry delay after a failed poll
    #[arg(long, env = "STATS_BACKOFF_FLOOR", default_value_t = 1)]
    pub stats_backoff_floor: u64,

    /// Seconds to wait before the first poll of a new run
    #[arg(long, env = "STATS_INITIAL_DELAY", default_value_t = 5)]
    pub stats_initial_delay: u64,

    /// Poll jitter as a fraction of the interval (at most 0.2)
    #[arg(long, env = "STATS_JITTER", default_value_t = 0.2)]
    pub stats_jitter: f64,

    /// How to reach Locust masters: auto, proxy or direct
    #[arg(long, env = "STATS_ACCESS", default_value_t = StatsAccess::Auto)]
    pub stats_access: StatsAccess,

    /// Port for the health server
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Install or update the LocustTest CRD on startup
    #[arg(
        long,
        env = "INSTALL_CRD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub install_crd: bool,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Log line format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Invalid operator configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{flag} must be greater than zero")]
    ZeroDuration { flag: &'static str },
}

impl OperatorArgs {
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            debug: self.debug,
            format: self.log_format,
        }
    }

    /// Stats daemon timing, with jitter clamped into range
    pub fn stats(&self) -> Result<StatsConfig, ConfigError> {
        if self.stats_interval == 0 {
            return Err(ConfigError::ZeroDuration {
                flag: "--stats-interval",
            });
        }
        if self.stats_backoff_floor == 0 {
            return Err(ConfigError::ZeroDuration {
                flag: "--stats-backoff-floor",
            });
        }

        Ok(StatsConfig {
            interval: Duration::from_secs(self.stats_interval),
            backoff_floor: Duration::from_secs(self.stats_backoff_floor),
            initial_delay: Duration::from_secs(self.stats_initial_delay),
            ..Default::default()
        }
        .with_jitter(self.stats_jitter))
    }
}
