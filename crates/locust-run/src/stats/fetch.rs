//! Stats snapshot fetchers
//!
//! Outside the cluster the master is only reachable through the API server's
//! service proxy; inside, the service DNS name is dialed directly. Both paths
//! decode through [`decode_snapshot`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::{decode_snapshot, StatsSnapshot, StatsTarget};
use crate::error::TelemetryFetchError;

/// Locust stats endpoint path
pub const STATS_PATH: &str = "/stats/requests";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetches one stats snapshot from a Locust master
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatsFetcher: Send + Sync {
    async fn fetch(&self, target: &StatsTarget) -> Result<StatsSnapshot, TelemetryFetchError>;
}

/// Fetcher going through the API server service proxy
pub struct ProxyStatsFetcher {
    client: Client,
}

impl ProxyStatsFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn path(target: &StatsTarget) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy{}",
            target.namespace, target.service, target.port, STATS_PATH
        )
    }
}

#[async_trait]
impl StatsFetcher for ProxyStatsFetcher {
    async fn fetch(&self, target: &StatsTarget) -> Result<StatsSnapshot, TelemetryFetchError> {
        let request = http::Request::get(Self::path(target))
            .body(Vec::new())
            .map_err(|e| TelemetryFetchError::Request(e.to_string()))?;

        let body = self.client.request_text(request).await.map_err(|e| match e {
            kube::Error::Api(ae) => TelemetryFetchError::Status { status: ae.code },
            other => TelemetryFetchError::Request(other.to_string()),
        })?;
        decode_snapshot(&body)
    }
}

/// Fetcher dialing the web service's cluster DNS name
pub struct DirectStatsFetcher {
    http: reqwest::Client,
}

impl DirectStatsFetcher {
    pub fn new() -> Result<Self, TelemetryFetchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TelemetryFetchError::Request(e.to_string()))?;
        Ok(Self { http })
    }

    fn url(target: &StatsTarget) -> String {
        format!(
            "http://{}.{}.svc:{}{}",
            target.service, target.namespace, target.port, STATS_PATH
        )
    }
}

#[async_trait]
impl StatsFetcher for DirectStatsFetcher {
    async fn fetch(&self, target: &StatsTarget) -> Result<StatsSnapshot, TelemetryFetchError> {
        let response = self
            .http
            .get(Self::url(target))
            .send()
            .await
            .map_err(|e| TelemetryFetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryFetchError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| TelemetryFetchError::Request(e.to_string()))?;
        decode_snapshot(&body)
    }
}

/// How stats daemons reach Locust masters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatsAccess {
    /// Direct inside a cluster, proxy otherwise
    #[default]
    Auto,
    /// Always through the API server service proxy
    Proxy,
    /// Always through cluster DNS
    Direct,
}

impl StatsAccess {
    /// Resolve `Auto` against the environment the operator runs in
    pub fn resolve(self, in_cluster: bool) -> StatsAccess {
        match self {
            StatsAccess::Auto if in_cluster => StatsAccess::Direct,
            StatsAccess::Auto => StatsAccess::Proxy,
            other => other,
        }
    }
}

impl fmt::Display for StatsAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsAccess::Auto => write!(f, "auto"),
            StatsAccess::Proxy => write!(f, "proxy"),
            StatsAccess::Direct => write!(f, "direct"),
        }
    }
}

impl FromStr for StatsAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(StatsAccess::Auto),
            "proxy" => Ok(StatsAccess::Proxy),
            "direct" => Ok(StatsAccess::Direct),
            other => Err(format!("unknown stats access mode: {other}")),
        }
    }
}

/// Build the fetcher for the given access mode
pub fn build_fetcher(
    access: StatsAccess,
    client: Client,
) -> Result<Arc<dyn StatsFetcher>, TelemetryFetchError> {
    let in_cluster = std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
    let resolved = access.resolve(in_cluster);
    debug!(requested = %access, resolved = %resolved, "selected stats access mode");

    match resolved {
        StatsAccess::Direct => Ok(Arc::new(DirectStatsFetcher::new()?)),
        _ => Ok(Arc::new(ProxyStatsFetcher::new(client))),
    }
}
