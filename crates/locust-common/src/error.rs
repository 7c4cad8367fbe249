//! Error types for the Locust operator
//!
//! Errors carry enough context (LocustTest name, field path, resource kind)
//! to be useful in a log line without the surrounding span.

use thiserror::Error;

/// Main error type for Locust operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for LocustTest specs
    #[error("validation error for {run}: {message}")]
    Validation {
        /// Name of the LocustTest with invalid configuration
        run: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.locustfile")
        field: Option<String>,
    },
}

impl Error {
    /// Create a validation error with LocustTest context and field path
    pub fn validation_for_field(
        run: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            run: run.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Check if this error is retryable
    ///
    /// Optimistic-concurrency conflicts (409), throttling (429), server errors
    /// and connectivity failures are transient. Every other 4xx needs a spec
    /// or environment change and is permanent, as are validation errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => Self::is_retryable_kube(source),
            Error::Validation { .. } => false,
        }
    }

    /// Retry classification for a bare kube-rs error
    pub fn is_retryable_kube(err: &kube::Error) -> bool {
        match err {
            kube::Error::Api(ae) => {
                ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
            }
            _ => true,
        }
    }
}
