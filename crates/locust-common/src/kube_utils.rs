//! Shared Kubernetes utilities using kube-rs

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::crd::LocustTest;
use crate::{
    Error, FIELD_MANAGER, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_LOCUST, LABEL_NAME,
    LABEL_NAME_LOCUST,
};

/// Labels every child object of a LocustTest carries
pub fn common_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), LABEL_NAME_LOCUST.to_string()),
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_LOCUST.to_string(),
        ),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Controller owner reference pointing at a LocustTest.
///
/// `blockOwnerDeletion` makes foreground deletion of the LocustTest wait for
/// its children; the garbage collector removes them either way.
pub fn owner_reference(name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: LocustTest::api_version(&()).to_string(),
        kind: LocustTest::kind(&()).to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// True if the object's metadata lists `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Add a finalizer to an object if it is not already present
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }

    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, &obj.name_any(), finalizers).await?;

    debug!(name = %obj.name_any(), finalizer, "added finalizer");
    Ok(())
}

/// Remove a finalizer from an object; a no-op when absent
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }

    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|s| *s != finalizer)
        .cloned()
        .collect();
    patch_finalizers(api, &obj.name_any(), finalizers).await?;

    debug!(name = %obj.name_any(), finalizer, "removed finalizer");
    Ok(())
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
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
