//! Common types for the Locust operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Field manager used for every write the operator performs
pub const FIELD_MANAGER: &str = "locust-operator";

/// Finalizer attached to every LocustTest.
///
/// Child objects are removed by ownership links; the finalizer only gives the
/// operator a chance to stop the stats daemon before the object disappears.
pub const FINALIZER: &str = "locust.io/finalizer";

/// Annotation holding the last successfully reconciled spec (JSON)
pub const LAST_HANDLED_SPEC_ANNOTATION: &str = "locust.io/last-handled-spec";

/// Standard Kubernetes name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Value of the name label on every child object
pub const LABEL_NAME_LOCUST: &str = "locust";

/// Standard Kubernetes instance label (carries the LocustTest name)
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label on every child object
pub const LABEL_MANAGED_BY_LOCUST: &str = "locust-operator";

/// Role label distinguishing master pods from worker pods
pub const LABEL_ROLE: &str = "locust.io/role";
