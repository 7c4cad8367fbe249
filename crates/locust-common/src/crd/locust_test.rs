//! LocustTest CRD types
//!
//! A `LocustTest` declares one distributed load-test run: a single master,
//! N workers, the services that connect them, and an optional inline script.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::run_spec::{RunSpec, ScriptSource};
use super::types::{
    default_locustfile_name, EnvVar, ImagePullPolicy, LocalObjectReference, LocustfileSpec,
    MasterPorts, PodOverlay, RoleResources, ServiceExposure,
};
use crate::Error;

// =============================================================================
// Phase
// =============================================================================

/// Reconciliation phase of a LocustTest
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RunPhase {
    /// Every child object exists and matches the spec
    Created,
    /// A transient failure interrupted convergence; a retry is pending
    Reconciling,
    /// The spec can never converge until the user changes it
    Invalid,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Invalid => write!(f, "Invalid"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Distributed Locust load test
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "locust.io",
    version = "v1alpha1",
    kind = "LocustTest",
    plural = "locusttests",
    shortname = "lt",
    namespaced,
    status = "LocustTestStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Users","type":"integer","jsonPath":".status.user_count"}"#,
    printcolumn = r#"{"name":"RPS","type":"integer","jsonPath":".status.total_rps"}"#,
    printcolumn = r#"{"name":"Workers","type":"string","jsonPath":".status.worker_ratio"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocustTestSpec {
    /// Master image (and worker image unless `workerImage` is set)
    #[serde(default = "default_image")]
    pub image: String,

    /// Worker image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_image: Option<String>,

    /// Number of worker replicas
    #[serde(default = "default_workers")]
    pub workers: i32,

    /// Target host passed to the master with `--host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Extra command line arguments appended to the master
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Environment for master and workers (names must be unique)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Per-role resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<RoleResources>,

    /// Web service exposure
    #[serde(default)]
    pub service: ServiceExposure,

    /// Locustfile source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locustfile: Option<LocustfileSpec>,

    /// Web UI and stats port
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    /// Ports workers use to reach the master
    #[serde(default)]
    pub master_ports: MasterPorts,

    /// Labels added to every child object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Annotations added to every child object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Master pod overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<PodOverlay>,

    /// Worker pod overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<PodOverlay>,

    /// Pull policy for both containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,

    /// Pull secrets for both pod templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

fn default_image() -> String {
    "locustio/locust:latest".to_string()
}

fn default_workers() -> i32 {
    1
}

fn default_web_port() -> u16 {
    8089
}

impl Default for LocustTestSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            worker_image: None,
            workers: default_workers(),
            host: None,
            extra_args: Vec::new(),
            env: Vec::new(),
            resources: None,
            service: ServiceExposure::default(),
            locustfile: None,
            web_port: default_web_port(),
            master_ports: MasterPorts::default(),
            labels: None,
            annotations: None,
            master: None,
            worker: None,
            image_pull_policy: None,
            image_pull_secrets: Vec::new(),
        }
    }
}

impl LocustTestSpec {
    /// Validate the spec and produce the typed [`RunSpec`] the reconciler consumes.
    ///
    /// `run` is only used to give errors context.
    pub fn validate(&self, run: &str) -> Result<RunSpec, Error> {
        if self.image.trim().is_empty() {
            return Err(Error::validation_for_field(run, "spec.image", "image must not be empty"));
        }
        if matches!(&self.worker_image, Some(img) if img.trim().is_empty()) {
            return Err(Error::validation_for_field(
                run,
                "spec.workerImage",
                "workerImage must not be empty when set",
            ));
        }
        if self.workers < 1 {
            return Err(Error::validation_for_field(
                run,
                "spec.workers",
                format!("workers must be at least 1, got {}", self.workers),
            ));
        }

        let mut seen = BTreeSet::new();
        for var in &self.env {
            if var.name.is_empty() {
                return Err(Error::validation_for_field(run, "spec.env", "env var name must not be empty"));
            }
            if !seen.insert(var.name.as_str()) {
                return Err(Error::validation_for_field(
                    run,
                    "spec.env",
                    format!("duplicate env var '{}'", var.name),
                ));
            }
        }

        let ports = [
            ("spec.webPort", self.web_port),
            ("spec.masterPorts.p1", self.master_ports.p1),
            ("spec.masterPorts.p2", self.master_ports.p2),
        ];
        for (field, port) in ports {
            if port == 0 {
                return Err(Error::validation_for_field(run, field, "port must be between 1 and 65535"));
            }
        }
        let distinct: BTreeSet<u16> = ports.iter().map(|(_, p)| *p).collect();
        if distinct.len() != ports.len() {
            return Err(Error::validation_for_field(
                run,
                "spec.masterPorts",
                "webPort, masterPorts.p1 and masterPorts.p2 must be distinct",
            ));
        }

        let script = match &self.locustfile {
            None => None,
            Some(LocustfileSpec {
                inline: Some(_),
                config_map: Some(_),
            }) => {
                return Err(Error::validation_for_field(
                    run,
                    "spec.locustfile",
                    "provide exactly one of `locustfile.inline` or `locustfile.configMap`",
                ));
            }
            Some(LocustfileSpec {
                inline: Some(inline),
                ..
            }) => {
                if inline.filename.is_empty()
                    || inline.filename.contains('/')
                    || inline.filename == "."
                    || inline.filename == ".."
                {
                    return Err(Error::validation_for_field(
                        run,
                        "spec.locustfile.inline.filename",
                        format!("'{}' is not a plain file name", inline.filename),
                    ));
                }
                Some(ScriptSource::Inline {
                    filename: inline.filename.clone(),
                    content: inline.content.clone(),
                })
            }
            Some(LocustfileSpec {
                config_map: Some(reference),
                ..
            }) => {
                if reference.name.is_empty() {
                    return Err(Error::validation_for_field(
                        run,
                        "spec.locustfile.configMap.name",
                        "configMap name must not be empty",
                    ));
                }
                Some(ScriptSource::ConfigMapRef {
                    name: reference.name.clone(),
                    filename: default_locustfile_name(),
                })
            }
            Some(LocustfileSpec {
                inline: None,
                config_map: None,
            }) => None,
        };

        let resources = self.resources.clone().unwrap_or_default();

        Ok(RunSpec {
            image: self.image.clone(),
            worker_image: self.worker_image.clone(),
            workers: self.workers,
            host: self.host.clone().filter(|h| !h.is_empty()),
            extra_args: self.extra_args.clone(),
            env: self.env.clone(),
            master_resources: resources.master,
            worker_resources: resources.worker,
            service_type: self.service.type_,
            script,
            web_port: self.web_port,
            master_ports: self.master_ports,
            labels: self.labels.clone().unwrap_or_default(),
            annotations: self.annotations.clone().unwrap_or_default(),
            master: self.master.clone().unwrap_or_default(),
            worker: self.worker.clone().unwrap_or_default(),
            image_pull_policy: self.image_pull_policy,
            image_pull_secrets: self.image_pull_secrets.clone(),
        })
    }
}

/// Status of a LocustTest
///
/// The reconciler owns `phase`, `message` and `observedGeneration`; the stats
/// daemon owns the telemetry fields. Both write through JSON merge patches so
/// neither clobbers the other.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocustTestStatus {
    /// Reconciliation phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,

    /// Human-readable message about the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last processed by the reconciler
    #[serde(
        default,
        rename = "observedGeneration",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,

    /// Locust runner state, upper-cased (e.g. `RUNNING`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Failure ratio as a percentage string (e.g. `12%`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_ratio: Option<String>,

    /// Aggregate requests per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rps: Option<i64>,

    /// Simulated users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_count: Option<i64>,

    /// Workers connected to the master
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<i64>,

    /// Connected vs expected workers (e.g. `3/5`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_ratio: Option<String>,

    /// Time of the last successful telemetry update
    #[serde(
        default,
        rename = "lastUpdated",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{InlineLocustfile, ServiceType};

    fn inline(content: &str) -> LocustfileSpec {
        LocustfileSpec {
            inline: Some(InlineLocustfile {
                filename: "main.py".to_string(),
                content: content.to_string(),
            }),
            config_map: None,
        }
    }

    #[test]
    fn minimal_manifest_fills_defaults() {
        let spec: LocustTestSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, LocustTestSpec::default());
        assert_eq!(spec.image, "locustio/locust:latest");
        assert_eq!(spec.workers, 1);
        assert_eq!(spec.web_port, 8089);
        assert_eq!(spec.master_ports, MasterPorts { p1: 5557, p2: 5558 });
        assert_eq!(spec.service.type_, ServiceType::ClusterIP);
    }

    #[test]
    fn yaml_manifest_parses() {
        let yaml = r#"
image: locustio/locust:2.31
workerImage: registry.local/locust-worker:2.31
workers: 4
host: https://shop.example.com
extraArgs: ["--users", "100"]
env:
  - name: LOG_LEVEL
    value: debug
resources:
  worker:
    limits:
      cpu: "1"
service:
  type: LoadBalancer
locustfile:
  configMap:
    name: shop-scripts
master:
  annotations:
    sidecar.istio.io/inject: "false"
imagePullPolicy: IfNotPresent
imagePullSecrets:
  - name: regcred
"#;
        let spec: LocustTestSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.workers, 4);
        assert_eq!(spec.service.type_, ServiceType::LoadBalancer);
        assert_eq!(spec.image_pull_policy, Some(ImagePullPolicy::IfNotPresent));

        let run = spec.validate("shop").unwrap();
        assert_eq!(run.worker_image(), "registry.local/locust-worker:2.31");
        assert_eq!(
            run.script,
            Some(ScriptSource::ConfigMapRef {
                name: "shop-scripts".to_string(),
                filename: "locustfile.py".to_string(),
            })
        );
        assert_eq!(run.extra_args, vec!["--users", "100"]);
        assert!(run.worker_resources.is_some());
        assert!(run.master_resources.is_none());
    }

    /// Story: both script sources at once is rejected before anything is built
    #[test]
    fn story_inline_and_config_map_together_is_invalid() {
        let mut spec = LocustTestSpec::default();
        spec.locustfile = Some(LocustfileSpec {
            config_map: Some(LocalObjectReference {
                name: "scripts".to_string(),
            }),
            ..inline("pass")
        });

        let err = spec.validate("both").unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let spec = LocustTestSpec {
            workers: 0,
            ..Default::default()
        };
        assert!(spec.validate("t").is_err());
    }

    #[test]
    fn duplicate_env_names_are_invalid() {
        let spec = LocustTestSpec {
            env: vec![EnvVar::new("A", "1"), EnvVar::new("B", "2"), EnvVar::new("A", "3")],
            ..Default::default()
        };
        let err = spec.validate("t").unwrap_err();
        assert!(err.to_string().contains("duplicate env var 'A'"));
    }

    #[test]
    fn colliding_ports_are_invalid() {
        let spec = LocustTestSpec {
            web_port: 5557,
            ..Default::default()
        };
        assert!(spec.validate("t").is_err());

        let spec = LocustTestSpec {
            master_ports: MasterPorts { p1: 0, p2: 5558 },
            ..Default::default()
        };
        assert!(spec.validate("t").is_err());
    }

    #[test]
    fn inline_filename_must_be_plain() {
        let mut spec = LocustTestSpec {
            locustfile: Some(inline("pass")),
            ..Default::default()
        };
        if let Some(InlineLocustfile { filename, .. }) =
            spec.locustfile.as_mut().and_then(|l| l.inline.as_mut())
        {
            *filename = "../etc/passwd".to_string();
        }
        assert!(spec.validate("t").is_err());
    }

    #[test]
    fn inline_script_becomes_inline_source() {
        let spec = LocustTestSpec {
            locustfile: Some(inline("from locust import HttpUser")),
            ..Default::default()
        };
        let run = spec.validate("t").unwrap();
        assert_eq!(
            run.script,
            Some(ScriptSource::Inline {
                filename: "main.py".to_string(),
                content: "from locust import HttpUser".to_string(),
            })
        );
        assert_eq!(run.script_filename(), "main.py");
    }

    #[test]
    fn empty_locustfile_block_means_no_script() {
        let spec = LocustTestSpec {
            locustfile: Some(LocustfileSpec::default()),
            host: Some(String::new()),
            ..Default::default()
        };
        let run = spec.validate("t").unwrap();
        assert!(run.script.is_none());
        assert!(run.host.is_none());
        assert_eq!(run.script_filename(), "locustfile.py");
    }

    #[test]
    fn status_uses_snake_case_telemetry_fields() {
        let status = LocustTestStatus {
            phase: Some(RunPhase::Created),
            fail_ratio: Some("12%".to_string()),
            total_rps: Some(40),
            worker_ratio: Some("3/5".to_string()),
            observed_generation: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Created");
        assert_eq!(json["fail_ratio"], "12%");
        assert_eq!(json["total_rps"], 40);
        assert_eq!(json["worker_ratio"], "3/5");
        assert_eq!(json["observedGeneration"], 2);
        assert!(json.get("state").is_none());
    }

    #[test]
    fn crd_has_status_subresource() {
        use kube::CustomResourceExt;
        let crd = LocustTest::crd();
        assert_eq!(crd.spec.group, "locust.io");
        assert_eq!(crd.spec.names.kind, "LocustTest");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
