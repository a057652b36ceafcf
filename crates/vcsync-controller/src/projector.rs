//! Initial host drafts built from tenant objects
//!
//! A draft carries the tenant identity (name, labels, annotations, spec) in
//! the mapped host namespace, with everything the host API server assigns or
//! owns stripped, and the back-reference marker stamped on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vcsync_common::{BackReference, Error, ANNOTATION_OWNER_REFERENCES, ANNOTATION_TENANT_UID};

/// Build host metadata for a tenant object
pub fn project_metadata(
    cluster: &str,
    host_namespace: &str,
    tenant: &ObjectMeta,
) -> Result<ObjectMeta, Error> {
    let tenant_namespace = tenant
        .namespace
        .as_deref()
        .ok_or_else(|| Error::validation_for_field("metadata.namespace", "object has no namespace"))?;

    let mut annotations = tenant.annotations.clone().unwrap_or_default();
    if let Some(uid) = &tenant.uid {
        annotations.insert(ANNOTATION_TENANT_UID.to_string(), uid.clone());
    }
    if let Some(owners) = tenant.owner_references.as_ref().filter(|o| !o.is_empty()) {
        let owners = serde_json::to_string(owners)
            .map_err(|e| Error::serialization_for_kind("OwnerReference", e.to_string()))?;
        annotations.insert(ANNOTATION_OWNER_REFERENCES.to_string(), owners);
    }

    let mut meta = ObjectMeta {
        name: tenant.name.clone(),
        generate_name: tenant.generate_name.clone(),
        namespace: Some(host_namespace.to_string()),
        labels: tenant.labels.clone(),
        annotations: Some(annotations),
        ..Default::default()
    };
    BackReference::new(cluster, tenant_namespace).stamp(&mut meta);
    Ok(meta)
}

/// Build the host draft of a tenant pod
pub fn project_pod(cluster: &str, host_namespace: &str, tenant: &Pod) -> Result<Pod, Error> {
    Ok(Pod {
        metadata: project_metadata(cluster, host_namespace, &tenant.metadata)?,
        spec: tenant.spec.clone(),
        status: None,
    })
}

/// Build the host draft of a tenant claim
///
/// The bound volume name is tenant-side state and is not carried over.
pub fn project_pvc(
    cluster: &str,
    host_namespace: &str,
    tenant: &PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim, Error> {
    let mut spec = tenant.spec.clone();
    if let Some(spec) = spec.as_mut() {
        spec.volume_name = None;
    }
    Ok(PersistentVolumeClaim {
        metadata: project_metadata(cluster, host_namespace, &tenant.metadata)?,
        spec,
        status: None,
    })
}

/// Labels of a host object, created if absent
pub(crate) fn labels_mut(meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
    meta.labels.get_or_insert_with(BTreeMap::new)
}
