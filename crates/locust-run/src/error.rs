//! Run-specific error types

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    Common(#[from] locust_common::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("locustfile ConfigMap '{name}' not found in namespace '{namespace}'")]
    ScriptConfigMapMissing { namespace: String, name: String },

    #[error("missing namespace on LocustTest")]
    MissingNamespace,

    #[error("missing uid on LocustTest")]
    MissingUid,
}

/// Failure fetching or decoding one stats snapshot; never fatal to the daemon
#[derive(Debug, thiserror::Error)]
pub enum TelemetryFetchError {
    #[error("stats request failed: {0}")]
    Request(String),

    #[error("stats endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("malformed stats response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RunError {
    /// Transient platform failures are retried; everything else waits for a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Common(e) => e.is_retryable(),
            RunError::Kube(e) => locust_common::Error::is_retryable_kube(e),
            RunError::Serialization(_)
            | RunError::ScriptConfigMapMissing { .. }
            | RunError::MissingNamespace
            | RunError::MissingUid => false,
        }
    }
}
