//! Controller runner - builds the LocustTest controller future
//!
//! The controller watches LocustTests and the Deployments, Services and
//! ConfigMaps they own, so drift in a child re-triggers its parent.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use locust_common::crd::LocustTest;
use locust_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_LOCUST};
use locust_run::controller::{error_policy, reconcile, RunContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Build the LocustTest controller future
pub fn build_run_controller(
    client: Client,
    namespace: Option<&str>,
    ctx: Arc<RunContext>,
) -> impl Future<Output = ()> + Send {
    let runs: Api<LocustTest> = scoped_api(&client, namespace);
    let owned = WatcherConfig::default()
        .timeout(WATCH_TIMEOUT_SECS)
        .labels(&format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_LOCUST}"));

    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- LocustTest controller"),
        None => tracing::info!("- LocustTest controller (all namespaces)"),
    }

    Controller::new(runs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(scoped_api::<Deployment>(&client, namespace), owned.clone())
        .owns(scoped_api::<Service>(&client, namespace), owned.clone())
        .owns(scoped_api::<ConfigMap>(&client, namespace), owned)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("LocustTest"))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
