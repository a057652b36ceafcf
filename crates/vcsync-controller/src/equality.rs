//! Drift detection between tenant intent and host reality
//!
//! Each check returns `None` when the host object already matches, or a
//! converged copy of the host object to write back. The candidate keeps the
//! host resourceVersion so the write is guarded by optimistic concurrency.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vcsync_common::SYNCER_KEY_PREFIX;

/// Tenant map plus the syncer-owned host keys
fn expected_map(
    host: Option<&BTreeMap<String, String>>,
    tenant: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut expected: BTreeMap<String, String> = host
        .into_iter()
        .flatten()
        .filter(|(k, _)| k.starts_with(SYNCER_KEY_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in tenant.into_iter().flatten() {
        if !key.starts_with(SYNCER_KEY_PREFIX) {
            expected.insert(key.clone(), value.clone());
        }
    }
    expected
}

fn map_differs(
    current: Option<&BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> bool {
    current.map_or(!expected.is_empty(), |c| c != expected)
}

/// Converge labels and annotations, returning whether anything changed
fn converge_metadata(host: &mut ObjectMeta, tenant: &ObjectMeta) -> bool {
    let mut changed = false;

    let labels = expected_map(host.labels.as_ref(), tenant.labels.as_ref());
    if map_differs(host.labels.as_ref(), &labels) {
        host.labels = Some(labels);
        changed = true;
    }

    let annotations = expected_map(host.annotations.as_ref(), tenant.annotations.as_ref());
    if map_differs(host.annotations.as_ref(), &annotations) {
        host.annotations = Some(annotations);
        changed = true;
    }

    changed
}

fn converge_images(host: &mut [Container], tenant: &[Container]) -> bool {
    let mut changed = false;
    for container in host.iter_mut() {
        let Some(wanted) = tenant.iter().find(|c| c.name == container.name) else {
            continue;
        };
        if container.image != wanted.image {
            container.image = wanted.image.clone();
            changed = true;
        }
    }
    changed
}

/// Compare a host pod with its tenant pod
///
/// Covers labels, annotations, container and init-container images and
/// `activeDeadlineSeconds`, the pod fields the API server lets change.
pub fn check_pod_equality(host: &Pod, tenant: &Pod) -> Option<Pod> {
    let mut candidate = host.clone();
    let mut changed = converge_metadata(&mut candidate.metadata, &tenant.metadata);

    if let (Some(spec), Some(wanted)) = (candidate.spec.as_mut(), tenant.spec.as_ref()) {
        changed |= converge_images(&mut spec.containers, &wanted.containers);
        if let (Some(init), Some(wanted_init)) =
            (spec.init_containers.as_mut(), wanted.init_containers.as_ref())
        {
            changed |= converge_images(init, wanted_init);
        }
        if spec.active_deadline_seconds != wanted.active_deadline_seconds {
            spec.active_deadline_seconds = wanted.active_deadline_seconds;
            changed = true;
        }
    }

    changed.then_some(candidate)
}

/// Compare a host claim with its tenant claim
///
/// Covers labels, annotations and requested resources (volume expansion).
pub fn check_pvc_equality(
    host: &PersistentVolumeClaim,
    tenant: &PersistentVolumeClaim,
) -> Option<PersistentVolumeClaim> {
    let mut candidate = host.clone();
    let mut changed = converge_metadata(&mut candidate.metadata, &tenant.metadata);

    if let (Some(spec), Some(wanted)) = (candidate.spec.as_mut(), tenant.spec.as_ref()) {
        if spec.resources != wanted.resources {
            spec.resources = wanted.resources.clone();
            changed = true;
        }
    }

    changed.then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use vcsync_common::{BackReference, LABEL_EXTEND_DEPLOYMENT_NAME};

    fn tenant_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod1".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: Some("nginx:1.27".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn host_pod() -> Pod {
        let mut pod = tenant_pod();
        pod.metadata.resource_version = Some("100".to_string());
        BackReference::new("west", "team-a").stamp(&mut pod.metadata);
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_EXTEND_DEPLOYMENT_NAME.to_string(), "web".to_string());
        pod
    }

    #[test]
    fn test_matching_pod_needs_no_update() {
        assert!(check_pod_equality(&host_pod(), &tenant_pod()).is_none());
    }

    #[test]
    fn test_image_change_converges_and_keeps_version() {
        let mut tenant = tenant_pod();
        if let Some(spec) = tenant.spec.as_mut() {
            spec.containers[0].image = Some("nginx:1.28".to_string());
        }

        let candidate = check_pod_equality(&host_pod(), &tenant).expect("drift");
        let spec = candidate.spec.expect("spec");
        assert_eq!(spec.containers[0].image.as_deref(), Some("nginx:1.28"));
        assert_eq!(candidate.metadata.resource_version.as_deref(), Some("100"));
    }

    #[test]
    fn test_label_change_preserves_syncer_keys() {
        let mut tenant = tenant_pod();
        tenant.metadata.labels = Some(BTreeMap::from([("app".to_string(), "api".to_string())]));

        let candidate = check_pod_equality(&host_pod(), &tenant).expect("drift");
        let labels = candidate.metadata.labels.clone().expect("labels");
        assert_eq!(labels["app"], "api");
        assert_eq!(labels[LABEL_EXTEND_DEPLOYMENT_NAME], "web");
        assert!(BackReference::from_meta(&candidate.metadata).is_some());
    }

    #[test]
    fn test_active_deadline_change() {
        let mut tenant = tenant_pod();
        if let Some(spec) = tenant.spec.as_mut() {
            spec.active_deadline_seconds = Some(30);
        }
        let candidate = check_pod_equality(&host_pod(), &tenant).expect("drift");
        assert_eq!(candidate.spec.expect("spec").active_deadline_seconds, Some(30));
    }

    fn pvc(storage: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_pvc_expansion_detected() {
        assert!(check_pvc_equality(&pvc("1Gi"), &pvc("1Gi")).is_none());
        let candidate = check_pvc_equality(&pvc("1Gi"), &pvc("5Gi")).expect("drift");
        let requests = candidate
            .spec
            .and_then(|s| s.resources)
            .and_then(|r| r.requests)
            .expect("requests");
        assert_eq!(requests["storage"], Quantity("5Gi".to_string()));
    }
}
