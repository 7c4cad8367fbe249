//! Validated, fully defaulted view of a LocustTest spec
//!
//! Produced once by [`LocustTestSpec::validate`](super::LocustTestSpec::validate);
//! everything downstream reads typed fields instead of probing optional ones.

use std::collections::BTreeMap;

use super::types::{
    EnvVar, ImagePullPolicy, LocalObjectReference, MasterPorts, PodOverlay,
    ResourceRequirements, ServiceType, DEFAULT_LOCUSTFILE_NAME,
};

/// Where the locustfile comes from once validated
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptSource {
    /// Script content shipped inline; the operator owns a ConfigMap for it
    Inline {
        /// File name inside the script volume
        filename: String,
        /// Script content
        content: String,
    },
    /// Script held by a user-managed ConfigMap that must already exist
    ConfigMapRef {
        /// ConfigMap name
        name: String,
        /// File name inside the script volume
        filename: String,
    },
}

/// Validated LocustTest configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSpec {
    /// Master image
    pub image: String,
    /// Worker image override
    pub worker_image: Option<String>,
    /// Worker replica count (always >= 1)
    pub workers: i32,
    /// Target host
    pub host: Option<String>,
    /// Extra master arguments
    pub extra_args: Vec<String>,
    /// Environment for both roles, names unique, order preserved
    pub env: Vec<EnvVar>,
    /// Master container resources
    pub master_resources: Option<ResourceRequirements>,
    /// Worker container resources
    pub worker_resources: Option<ResourceRequirements>,
    /// Web service type
    pub service_type: ServiceType,
    /// Script source; `None` mounts an empty scratch volume
    pub script: Option<ScriptSource>,
    /// Web UI / stats port
    pub web_port: u16,
    /// Master ports
    pub master_ports: MasterPorts,
    /// Labels for every child object
    pub labels: BTreeMap<String, String>,
    /// Annotations for every child object
    pub annotations: BTreeMap<String, String>,
    /// Master pod overlay
    pub master: PodOverlay,
    /// Worker pod overlay
    pub worker: PodOverlay,
    /// Pull policy for both containers
    pub image_pull_policy: Option<ImagePullPolicy>,
    /// Pull secrets for both pod templates
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

impl RunSpec {
    /// Image used by worker pods
    pub fn worker_image(&self) -> &str {
        self.worker_image.as_deref().unwrap_or(&self.image)
    }

    /// File name the containers pass to `-f`
    pub fn script_filename(&self) -> &str {
        match &self.script {
            Some(ScriptSource::Inline { filename, .. })
            | Some(ScriptSource::ConfigMapRef { filename, .. }) => filename,
            None => DEFAULT_LOCUSTFILE_NAME,
        }
    }

    /// Name of the user-managed ConfigMap that must exist before reconciling
    pub fn referenced_config_map(&self) -> Option<&str> {
        match &self.script {
            Some(ScriptSource::ConfigMapRef { name, .. }) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::crd::LocustTestSpec;

    #[test]
    fn worker_image_defaults_to_master_image() {
        let run = LocustTestSpec {
            image: "x:1".to_string(),
            ..Default::default()
        }
        .validate("t")
        .unwrap();
        assert_eq!(run.worker_image(), "x:1");

        let run = LocustTestSpec {
            image: "x:1".to_string(),
            worker_image: Some("y:1".to_string()),
            ..Default::default()
        }
        .validate("t")
        .unwrap();
        assert_eq!(run.worker_image(), "y:1");
    }

    #[test]
    fn only_config_map_refs_need_external_verification() {
        let run = LocustTestSpec::default().validate("t").unwrap();
        assert!(run.referenced_config_map().is_none());
    }
}
