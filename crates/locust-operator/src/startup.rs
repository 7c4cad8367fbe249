//! Startup tasks run before the controller begins watching

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use locust_common::crd::LocustTest;
use locust_common::FIELD_MANAGER;

/// Full CRD name as registered with the API server
pub fn crd_name() -> String {
    let crd = LocustTest::crd();
    crd.metadata.name.unwrap_or_default()
}

/// Render the LocustTest CRD as YAML
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&LocustTest::crd())
}

/// Install or update the LocustTest CRD with server-side apply
pub async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let name = crd_name();

    tracing::info!(crd = %name, "Installing LocustTest CRD...");
    crds.patch(&name, &params, &Patch::Apply(&LocustTest::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install LocustTest CRD: {}", e))?;
    Ok(())
}
