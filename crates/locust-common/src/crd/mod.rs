//! Custom Resource Definitions for the Locust operator

mod locust_test;
mod run_spec;
mod types;

pub use locust_test::{LocustTest, LocustTestSpec, LocustTestStatus, RunPhase};
pub use run_spec::{RunSpec, ScriptSource};
pub use types::{
    EnvVar, ImagePullPolicy, InlineLocustfile, LocalObjectReference, LocustfileSpec,
    MasterPorts, PodOverlay, ResourceRequirements, RoleResources, ServiceExposure, ServiceType,
    DEFAULT_LOCUSTFILE_NAME,
};
