//! Kubernetes access for the LocustTest reconciler and stats daemon
//!
//! Everything the core does against the API server goes through
//! [`RunKubeClient`] so reconcile and daemon logic can run against a mock.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use locust_common::crd::LocustTest;
use locust_common::kube_utils;
use locust_common::{FIELD_MANAGER, FINALIZER, LAST_HANDLED_SPEC_ANNOTATION};

use crate::error::RunError;

/// Kind of a child object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    ConfigMap,
    Service,
    Deployment,
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::Service => write!(f, "Service"),
            Self::Deployment => write!(f, "Deployment"),
        }
    }
}

/// A desired child object ready to be created or patched
#[derive(Clone, Debug, PartialEq)]
pub enum ChildResource {
    ConfigMap(ConfigMap),
    Service(Service),
    Deployment(Deployment),
}

impl ChildResource {
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::Service(_) => ChildKind::Service,
            Self::Deployment(_) => ChildKind::Deployment,
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Self::ConfigMap(cm) => &cm.metadata,
            Self::Service(svc) => &svc.metadata,
            Self::Deployment(d) => &d.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }
}

/// Trait abstracting Kubernetes client operations for LocustTest runs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunKubeClient: Send + Sync {
    /// True if a child object with this kind and name exists
    async fn child_exists(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<bool, RunError>;

    /// Create a child object
    async fn create_child(&self, namespace: &str, child: &ChildResource) -> Result<(), RunError>;

    /// Bring an existing child object to exactly the given state (server-side apply)
    async fn patch_child(&self, namespace: &str, child: &ChildResource) -> Result<(), RunError>;

    /// Delete a Deployment; its pods are garbage collected in the background.
    /// A missing Deployment is not an error.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), RunError>;

    /// Merge-patch fields of the LocustTest status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), RunError>;

    /// Store the spec JSON the last successful reconcile was computed from
    async fn record_handled_spec(
        &self,
        namespace: &str,
        name: &str,
        spec_json: &str,
    ) -> Result<(), RunError>;

    /// Ensure the operator finalizer is present
    async fn add_finalizer(&self, run: &LocustTest) -> Result<(), RunError>;

    /// Remove the operator finalizer
    async fn remove_finalizer(&self, run: &LocustTest) -> Result<(), RunError>;
}

/// Real Kubernetes client implementation
pub struct KubeRunClient {
    client: Client,
}

impl KubeRunClient {
    /// Create a new KubeRunClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn exists<K>(api: Api<K>, name: &str) -> Result<bool, RunError>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api.get_opt(name).await?.is_some())
}

async fn create<K>(api: Api<K>, obj: &K) -> Result<(), RunError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    api.create(&params, obj).await?;
    Ok(())
}

/// Server-side apply parameters for child objects
///
/// Forced so the operator owns every field it renders; lists and maps it
/// stops rendering are pruned instead of merged.
pub fn child_apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

async fn apply<K>(api: Api<K>, name: &str, obj: &K) -> Result<(), RunError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    api.patch(name, &child_apply_params(), &Patch::Apply(obj))
        .await?;
    Ok(())
}

#[async_trait]
impl RunKubeClient for KubeRunClient {
    async fn child_exists(
        &self,
        namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<bool, RunError> {
        match kind {
            ChildKind::ConfigMap => exists(self.api::<ConfigMap>(namespace), name).await,
            ChildKind::Service => exists(self.api::<Service>(namespace), name).await,
            ChildKind::Deployment => exists(self.api::<Deployment>(namespace), name).await,
        }
    }

    async fn create_child(&self, namespace: &str, child: &ChildResource) -> Result<(), RunError> {
        debug!(kind = %child.kind(), name = %child.name(), "creating child");
        match child {
            ChildResource::ConfigMap(cm) => create(self.api(namespace), cm).await,
            ChildResource::Service(svc) => create(self.api(namespace), svc).await,
            ChildResource::Deployment(d) => create(self.api(namespace), d).await,
        }
    }

    async fn patch_child(&self, namespace: &str, child: &ChildResource) -> Result<(), RunError> {
        debug!(kind = %child.kind(), name = %child.name(), "applying child");
        let name = child.name();
        match child {
            ChildResource::ConfigMap(cm) => apply(self.api(namespace), name, cm).await,
            ChildResource::Service(svc) => apply(self.api(namespace), name, svc).await,
            ChildResource::Deployment(d) => apply(self.api(namespace), name, d).await,
        }
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), RunError> {
        let api: Api<Deployment> = self.api(namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(deployment = %name, "deleted deployment");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), RunError> {
        let api: Api<LocustTest> = self.api(namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn record_handled_spec(
        &self,
        namespace: &str,
        name: &str,
        spec_json: &str,
    ) -> Result<(), RunError> {
        let api: Api<LocustTest> = self.api(namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    LAST_HANDLED_SPEC_ANNOTATION: spec_json
                }
            }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, run: &LocustTest) -> Result<(), RunError> {
        let namespace = run.meta().namespace.as_deref().ok_or(RunError::MissingNamespace)?;
        let api: Api<LocustTest> = self.api(namespace);
        kube_utils::add_finalizer(&api, run, FINALIZER).await?;
        Ok(())
    }

    async fn remove_finalizer(&self, run: &LocustTest) -> Result<(), RunError> {
        let namespace = run.meta().namespace.as_deref().ok_or(RunError::MissingNamespace)?;
        let api: Api<LocustTest> = self.api(namespace);
        kube_utils::remove_finalizer(&api, run, FINALIZER).await?;
        Ok(())
    }
}
