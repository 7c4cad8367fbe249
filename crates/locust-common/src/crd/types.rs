//! Shared field types for the LocustTest CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default locustfile name inside the script volume
pub const DEFAULT_LOCUSTFILE_NAME: &str = "locustfile.py";

/// Environment variable passed to both master and worker containers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name (unique within the list)
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    /// Create a new environment variable
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

/// Compute resource requests and limits, as Kubernetes quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Minimum resources (e.g. `cpu: 500m`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
    /// Maximum resources (e.g. `memory: 1Gi`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
}

/// Per-role resource requirements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RoleResources {
    /// Requirements for the master container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<ResourceRequirements>,
    /// Requirements for each worker container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<ResourceRequirements>,
}

/// Labels and annotations merged into one role's pod template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PodOverlay {
    /// Extra pod labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Extra pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// How the web UI / reporting service is exposed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    /// Reachable only inside the cluster
    #[default]
    ClusterIP,
    /// Exposed on every node
    NodePort,
    /// Exposed through a cloud load balancer
    LoadBalancer,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClusterIP => write!(f, "ClusterIP"),
            Self::NodePort => write!(f, "NodePort"),
            Self::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

/// Web service exposure settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServiceExposure {
    /// Service type of the web service (the control service is always ClusterIP)
    #[serde(default, rename = "type")]
    pub type_: ServiceType,
}

/// Container image pull policy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull
    Always,
    /// Pull only when missing on the node
    IfNotPresent,
    /// Never pull
    Never,
}

impl std::fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::IfNotPresent => write!(f, "IfNotPresent"),
            Self::Never => write!(f, "Never"),
        }
    }
}

/// Locustfile shipped inline in the LocustTest
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InlineLocustfile {
    /// File name inside the script volume
    #[serde(default = "default_locustfile_name")]
    pub filename: String,
    /// Python source of the locustfile
    pub content: String,
}

/// Where the locustfile comes from
///
/// At most one of `inline` and `configMap` may be set; this is checked by
/// [`LocustTestSpec::validate`](super::LocustTestSpec::validate).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocustfileSpec {
    /// Inline script; the operator creates a ConfigMap for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineLocustfile>,
    /// Pre-existing ConfigMap holding the script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<LocalObjectReference>,
}

/// Master ports workers connect to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MasterPorts {
    /// Master bind port
    #[serde(default = "default_master_p1")]
    pub p1: u16,
    /// Secondary master port
    #[serde(default = "default_master_p2")]
    pub p2: u16,
}

impl Default for MasterPorts {
    fn default() -> Self {
        Self {
            p1: default_master_p1(),
            p2: default_master_p2(),
        }
    }
}

pub(crate) fn default_locustfile_name() -> String {
    DEFAULT_LOCUSTFILE_NAME.to_string()
}

fn default_master_p1() -> u16 {
    5557
}

fn default_master_p2() -> u16 {
    5558
}
