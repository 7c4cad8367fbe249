//! RunCompiler: maps a validated LocustTest spec to its child objects
//!
//! Compilation is pure. The same `(RunInstance, RunSpec)` always yields the
//! same objects, so the reconciler can recompute them on every pass instead
//! of caching anything between events.
//!
//! Child naming is a fixed function of the run name and a role suffix:
//! - `<name>-locustfile`: ConfigMap (inline scripts only)
//! - `<name>-master`: control Service and master Deployment
//! - `<name>-web`: web UI / stats Service
//! - `<name>-worker`: worker Deployment

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    EnvVar as K8sEnvVar, LocalObjectReference as K8sLocalObjectReference, ObjectReference, PodSpec,
    PodTemplateSpec, ResourceRequirements as K8sResourceRequirements, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use locust_common::crd::{
    LocustTest, PodOverlay, ResourceRequirements, RunSpec, ScriptSource, ServiceType,
};
use locust_common::kube_utils::{common_labels, owner_reference};
use locust_common::LABEL_ROLE;

use crate::error::RunError;

/// Directory the script volume is mounted at in both containers
pub const SCRIPT_MOUNT_PATH: &str = "/mnt/locust";

const SCRIPT_VOLUME: &str = "locustfile";

/// Container port names
pub const PORT_WEB: &str = "master-web";
/// Master bind port name
pub const PORT_P1: &str = "master-p1";
/// Secondary master port name
pub const PORT_P2: &str = "master-p2";

const ROLE_MASTER: &str = "master";
const ROLE_WORKER: &str = "worker";

/// Name of the operator-owned locustfile ConfigMap
pub fn config_map_name(run: &str) -> String {
    format!("{run}-locustfile")
}

/// Name of the control Service and the master Deployment
pub fn master_name(run: &str) -> String {
    format!("{run}-master")
}

/// Name of the web UI / stats Service
pub fn web_service_name(run: &str) -> String {
    format!("{run}-web")
}

/// Name of the worker Deployment
pub fn worker_name(run: &str) -> String {
    format!("{run}-worker")
}

/// Identity of the LocustTest being compiled
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunInstance {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// `metadata.generation`, reported back as `observedGeneration`
    pub generation: Option<i64>,
    /// Spec JSON persisted as the diff base once a restart has torn down
    pub spec_json: Option<String>,
}

impl RunInstance {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            generation: None,
            spec_json: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_spec_json(mut self, spec_json: impl Into<String>) -> Self {
        self.spec_json = Some(spec_json.into());
        self
    }

    /// Extract identity from a stored LocustTest
    pub fn from_resource(run: &LocustTest) -> Result<Self, RunError> {
        let namespace = run.namespace().ok_or(RunError::MissingNamespace)?;
        let uid = run.uid().ok_or(RunError::MissingUid)?;
        let spec_json = serde_json::to_string(&run.spec)?;
        Ok(Self::new(run.name_any(), namespace, uid)
            .with_generation(run.metadata.generation)
            .with_spec_json(spec_json))
    }

    /// Reference used when publishing Events about this run
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(LocustTest::api_version(&()).to_string()),
            kind: Some(LocustTest::kind(&()).to_string()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: Some(self.uid.clone()),
            ..Default::default()
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn owner_reference(&self) -> OwnerReference {
        owner_reference(&self.name, &self.uid)
    }
}

/// Complete compiled output for one LocustTest
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledRun {
    /// Locustfile ConfigMap, present only for inline scripts
    pub config_map: Option<ConfigMap>,
    /// ClusterIP Service workers dial
    pub master_service: Service,
    /// Web UI / stats Service
    pub web_service: Service,
    /// Master Deployment, always one replica
    pub master: Deployment,
    /// Worker Deployment, `workers` replicas
    pub worker: Deployment,
}

impl CompiledRun {
    /// Number of objects the reconciler will upsert
    pub fn resource_count(&self) -> usize {
        4 + usize::from(self.config_map.is_some())
    }
}

/// Compile a validated spec into the desired child objects
pub fn compile_run(instance: &RunInstance, spec: &RunSpec) -> CompiledRun {
    let config_map = match &spec.script {
        Some(ScriptSource::Inline { filename, content }) => Some(ConfigMap {
            metadata: object_meta(instance, config_map_name(&instance.name), spec),
            data: Some(BTreeMap::from([(filename.clone(), content.clone())])),
            ..Default::default()
        }),
        _ => None,
    };

    CompiledRun {
        config_map,
        master_service: master_service(instance, spec),
        web_service: web_service(instance, spec),
        master: master_deployment(instance, spec),
        worker: worker_deployment(instance, spec),
    }
}

fn object_meta(instance: &RunInstance, name: String, spec: &RunSpec) -> ObjectMeta {
    let mut labels = spec.labels.clone();
    labels.extend(common_labels(&instance.name));

    ObjectMeta {
        name: Some(name),
        namespace: Some(instance.namespace.clone()),
        labels: Some(labels),
        annotations: non_empty(spec.annotations.clone()),
        owner_references: Some(vec![instance.owner_reference()]),
        ..Default::default()
    }
}

fn selector_labels(instance: &RunInstance, role: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(&instance.name);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then_some(map)
}

fn master_service(instance: &RunInstance, spec: &RunSpec) -> Service {
    Service {
        metadata: object_meta(instance, master_name(&instance.name), spec),
        spec: Some(ServiceSpec {
            type_: Some(ServiceType::ClusterIP.to_string()),
            selector: Some(selector_labels(instance, ROLE_MASTER)),
            ports: Some(vec![
                service_port(PORT_P1, spec.master_ports.p1),
                service_port(PORT_P2, spec.master_ports.p2),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn web_service(instance: &RunInstance, spec: &RunSpec) -> Service {
    Service {
        metadata: object_meta(instance, web_service_name(&instance.name), spec),
        spec: Some(ServiceSpec {
            type_: Some(spec.service_type.to_string()),
            selector: Some(selector_labels(instance, ROLE_MASTER)),
            ports: Some(vec![service_port(PORT_WEB, spec.web_port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn master_deployment(instance: &RunInstance, spec: &RunSpec) -> Deployment {
    let mut args = vec![
        "-f".to_string(),
        script_path(spec),
        "--master".to_string(),
        format!("--web-port={}", spec.web_port),
        format!("--master-bind-port={}", spec.master_ports.p1),
    ];
    if let Some(host) = &spec.host {
        args.push("--host".to_string());
        args.push(host.clone());
    }
    args.extend(spec.extra_args.iter().cloned());

    let container = Container {
        name: ROLE_MASTER.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: spec.image_pull_policy.map(|p| p.to_string()),
        args: Some(args),
        ports: Some(vec![
            container_port(PORT_WEB, spec.web_port),
            container_port(PORT_P1, spec.master_ports.p1),
            container_port(PORT_P2, spec.master_ports.p2),
        ]),
        env: container_env(spec),
        resources: spec.master_resources.as_ref().map(resource_requirements),
        volume_mounts: Some(vec![script_mount()]),
        ..Default::default()
    };

    deployment(
        instance,
        spec,
        master_name(&instance.name),
        ROLE_MASTER,
        1,
        &spec.master,
        container,
    )
}

fn worker_deployment(instance: &RunInstance, spec: &RunSpec) -> Deployment {
    let args = vec![
        "-f".to_string(),
        script_path(spec),
        "--worker".to_string(),
        format!("--master-host={}", master_name(&instance.name)),
        format!("--master-port={}", spec.master_ports.p1),
    ];

    let container = Container {
        name: ROLE_WORKER.to_string(),
        image: Some(spec.worker_image().to_string()),
        image_pull_policy: spec.image_pull_policy.map(|p| p.to_string()),
        args: Some(args),
        env: container_env(spec),
        resources: spec.worker_resources.as_ref().map(resource_requirements),
        volume_mounts: Some(vec![script_mount()]),
        ..Default::default()
    };

    deployment(
        instance,
        spec,
        worker_name(&instance.name),
        ROLE_WORKER,
        spec.workers,
        &spec.worker,
        container,
    )
}

fn deployment(
    instance: &RunInstance,
    spec: &RunSpec,
    name: String,
    role: &str,
    replicas: i32,
    overlay: &PodOverlay,
    container: Container,
) -> Deployment {
    let selector = selector_labels(instance, role);

    // Selector labels go last so no overlay can detach pods from their Deployment
    let mut pod_labels = spec.labels.clone();
    pod_labels.extend(overlay.labels.clone());
    pod_labels.extend(selector.clone());

    let mut pod_annotations = spec.annotations.clone();
    pod_annotations.extend(overlay.annotations.clone());

    let image_pull_secrets: Vec<K8sLocalObjectReference> = spec
        .image_pull_secrets
        .iter()
        .map(|s| K8sLocalObjectReference {
            name: s.name.clone(),
        })
        .collect();

    Deployment {
        metadata: object_meta(instance, name, spec),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: non_empty(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![script_volume(instance, spec)]),
                    image_pull_secrets: (!image_pull_secrets.is_empty())
                        .then_some(image_pull_secrets),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn container_env(spec: &RunSpec) -> Option<Vec<K8sEnvVar>> {
    if spec.env.is_empty() {
        return None;
    }
    Some(
        spec.env
            .iter()
            .map(|e| K8sEnvVar {
                name: e.name.clone(),
                value: Some(e.value.clone()),
                ..Default::default()
            })
            .collect(),
    )
}

fn resource_requirements(req: &ResourceRequirements) -> K8sResourceRequirements {
    let quantities = |m: &Option<BTreeMap<String, String>>| {
        m.as_ref().map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    K8sResourceRequirements {
        requests: quantities(&req.requests),
        limits: quantities(&req.limits),
        ..Default::default()
    }
}

fn script_path(spec: &RunSpec) -> String {
    format!("{SCRIPT_MOUNT_PATH}/{}", spec.script_filename())
}

fn script_mount() -> VolumeMount {
    VolumeMount {
        name: SCRIPT_VOLUME.to_string(),
        mount_path: SCRIPT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// ConfigMap volume when a script exists, otherwise an empty scratch dir so
/// pods still schedule and Locust reports the missing file itself
fn script_volume(instance: &RunInstance, spec: &RunSpec) -> Volume {
    let config_map = match &spec.script {
        Some(ScriptSource::Inline { .. }) => Some(config_map_name(&instance.name)),
        Some(ScriptSource::ConfigMapRef { name, .. }) => Some(name.clone()),
        None => None,
    };

    match config_map {
        Some(name) => Volume {
            name: SCRIPT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name,
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: SCRIPT_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locust_common::crd::{
        EnvVar, InlineLocustfile, LocalObjectReference, LocustTestSpec, LocustfileSpec,
        RoleResources,
    };
    use locust_common::{LABEL_INSTANCE, LABEL_MANAGED_BY};

    fn instance() -> RunInstance {
        RunInstance::new("checkout", "load", "uid-123")
    }

    fn run(spec: LocustTestSpec) -> RunSpec {
        spec.validate("checkout").unwrap()
    }

    fn inline_spec() -> LocustTestSpec {
        LocustTestSpec {
            image: "x:1".to_string(),
            workers: 3,
            host: Some("https://shop.example.com".to_string()),
            extra_args: vec!["--headless".to_string()],
            env: vec![EnvVar::new("TARGET", "shop")],
            locustfile: Some(LocustfileSpec {
                inline: Some(InlineLocustfile {
                    filename: "main.py".to_string(),
                    content: "from locust import HttpUser".to_string(),
                }),
                config_map: None,
            }),
            ..Default::default()
        }
    }

    fn pod_spec(d: &Deployment) -> &PodSpec {
        d.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    fn args(d: &Deployment) -> Vec<String> {
        pod_spec(d).containers[0].args.clone().unwrap()
    }

    #[test]
    fn compile_is_deterministic() {
        let spec = run(inline_spec());
        assert_eq!(
            compile_run(&instance(), &spec),
            compile_run(&instance(), &spec)
        );
    }

    #[test]
    fn children_use_role_suffixed_names() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        assert_eq!(
            compiled.config_map.as_ref().unwrap().metadata.name.as_deref(),
            Some("checkout-locustfile")
        );
        assert_eq!(
            compiled.master_service.metadata.name.as_deref(),
            Some("checkout-master")
        );
        assert_eq!(
            compiled.web_service.metadata.name.as_deref(),
            Some("checkout-web")
        );
        assert_eq!(compiled.master.metadata.name.as_deref(), Some("checkout-master"));
        assert_eq!(compiled.worker.metadata.name.as_deref(), Some("checkout-worker"));
        assert_eq!(compiled.resource_count(), 5);
    }

    #[test]
    fn every_child_is_owned_by_the_run() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        let metas = [
            &compiled.config_map.as_ref().unwrap().metadata,
            &compiled.master_service.metadata,
            &compiled.web_service.metadata,
            &compiled.master.metadata,
            &compiled.worker.metadata,
        ];
        for meta in metas {
            let owners = meta.owner_references.as_ref().unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].uid, "uid-123");
            assert_eq!(owners[0].controller, Some(true));
            assert_eq!(meta.namespace.as_deref(), Some("load"));
        }
    }

    #[test]
    fn inline_script_lands_in_config_map_under_its_filename() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        let data = compiled.config_map.unwrap().data.unwrap();
        assert_eq!(
            data.get("main.py").map(String::as_str),
            Some("from locust import HttpUser")
        );
    }

    #[test]
    fn config_map_reference_is_mounted_without_building_one() {
        let spec = LocustTestSpec {
            locustfile: Some(LocustfileSpec {
                inline: None,
                config_map: Some(LocalObjectReference {
                    name: "shared-scripts".to_string(),
                }),
            }),
            ..Default::default()
        };
        let compiled = compile_run(&instance(), &run(spec));
        assert!(compiled.config_map.is_none());
        assert_eq!(compiled.resource_count(), 4);

        let volume = &pod_spec(&compiled.master).volumes.as_ref().unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "shared-scripts");
        assert!(args(&compiled.master).contains(&"/mnt/locust/locustfile.py".to_string()));
    }

    #[test]
    fn missing_script_falls_back_to_scratch_volume() {
        let compiled = compile_run(&instance(), &run(LocustTestSpec::default()));
        for d in [&compiled.master, &compiled.worker] {
            let volume = &pod_spec(d).volumes.as_ref().unwrap()[0];
            assert!(volume.empty_dir.is_some());
            assert!(volume.config_map.is_none());
        }
    }

    #[test]
    fn master_command_line() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        assert_eq!(
            args(&compiled.master),
            vec![
                "-f",
                "/mnt/locust/main.py",
                "--master",
                "--web-port=8089",
                "--master-bind-port=5557",
                "--host",
                "https://shop.example.com",
                "--headless",
            ]
        );
        let ports: Vec<_> = pod_spec(&compiled.master).containers[0]
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| (p.name.clone().unwrap(), p.container_port))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("master-web".to_string(), 8089),
                ("master-p1".to_string(), 5557),
                ("master-p2".to_string(), 5558),
            ]
        );
    }

    #[test]
    fn worker_command_line_targets_master_service() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        assert_eq!(
            args(&compiled.worker),
            vec![
                "-f",
                "/mnt/locust/main.py",
                "--worker",
                "--master-host=checkout-master",
                "--master-port=5557",
            ]
        );
    }

    #[test]
    fn replica_counts() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        assert_eq!(compiled.master.spec.as_ref().unwrap().replicas, Some(1));
        assert_eq!(compiled.worker.spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn worker_image_override_only_touches_workers() {
        let spec = LocustTestSpec {
            worker_image: Some("x:worker".to_string()),
            ..inline_spec()
        };
        let compiled = compile_run(&instance(), &run(spec));
        assert_eq!(
            pod_spec(&compiled.master).containers[0].image.as_deref(),
            Some("x:1")
        );
        assert_eq!(
            pod_spec(&compiled.worker).containers[0].image.as_deref(),
            Some("x:worker")
        );
    }

    #[test]
    fn services_select_master_pods() {
        let compiled = compile_run(&instance(), &run(inline_spec()));
        for svc in [&compiled.master_service, &compiled.web_service] {
            let selector = svc.spec.as_ref().unwrap().selector.as_ref().unwrap();
            assert_eq!(selector.get(LABEL_ROLE).map(String::as_str), Some("master"));
            assert_eq!(
                selector.get(LABEL_INSTANCE).map(String::as_str),
                Some("checkout")
            );
        }
        let control = compiled.master_service.spec.as_ref().unwrap();
        assert_eq!(control.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(control.ports.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn web_service_follows_exposure_mode() {
        let mut spec = inline_spec();
        spec.service.type_ = ServiceType::LoadBalancer;
        spec.web_port = 9000;
        let compiled = compile_run(&instance(), &run(spec));
        let web = compiled.web_service.spec.unwrap();
        assert_eq!(web.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(web.ports.unwrap()[0].port, 9000);
    }

    #[test]
    fn overlays_cannot_override_selector_labels() {
        let mut spec = inline_spec();
        spec.labels = Some(BTreeMap::from([
            ("team".to_string(), "perf".to_string()),
            (LABEL_MANAGED_BY.to_string(), "someone-else".to_string()),
        ]));
        spec.worker = Some(PodOverlay {
            labels: BTreeMap::from([(LABEL_ROLE.to_string(), "master".to_string())]),
            annotations: BTreeMap::from([("sidecar".to_string(), "off".to_string())]),
        });
        let compiled = compile_run(&instance(), &run(spec));

        let template = compiled.worker.spec.as_ref().unwrap().template.metadata.as_ref().unwrap();
        let labels = template.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_ROLE).map(String::as_str), Some("worker"));
        assert_eq!(labels.get("team").map(String::as_str), Some("perf"));
        assert_eq!(
            template.annotations.as_ref().unwrap().get("sidecar").map(String::as_str),
            Some("off")
        );

        let meta_labels = compiled.master_service.metadata.labels.as_ref().unwrap();
        assert_eq!(
            meta_labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some("locust-operator")
        );
    }

    #[test]
    fn per_role_resources_become_quantities() {
        let mut spec = inline_spec();
        spec.resources = Some(RoleResources {
            master: None,
            worker: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([("cpu".to_string(), "500m".to_string())])),
                limits: None,
            }),
        });
        let compiled = compile_run(&instance(), &run(spec));
        assert!(pod_spec(&compiled.master).containers[0].resources.is_none());
        let worker = pod_spec(&compiled.worker).containers[0]
            .resources
            .clone()
            .unwrap();
        assert_eq!(
            worker.requests.unwrap().get("cpu"),
            Some(&Quantity("500m".to_string()))
        );
    }

    #[test]
    fn from_resource_requires_namespace_and_uid() {
        let mut test = LocustTest::new("checkout", LocustTestSpec::default());
        assert!(matches!(
            RunInstance::from_resource(&test),
            Err(RunError::MissingNamespace)
        ));
        test.metadata.namespace = Some("load".to_string());
        assert!(matches!(
            RunInstance::from_resource(&test),
            Err(RunError::MissingUid)
        ));
        test.metadata.uid = Some("uid-123".to_string());
        test.metadata.generation = Some(4);
        let instance = RunInstance::from_resource(&test).unwrap();
        assert_eq!(instance.key(), "load/checkout");
        assert_eq!(instance.generation, Some(4));
        assert_eq!(
            instance.spec_json.as_deref(),
            Some(serde_json::to_string(&test.spec).unwrap().as_str())
        );

        let reference = instance.object_ref();
        assert_eq!(reference.kind.as_deref(), Some("LocustTest"));
        assert_eq!(reference.uid.as_deref(), Some("uid-123"));
    }
}
