//! Claim downward reconciler
//!
//! Same transition table as pods without the pod-only steps: no scheduling
//! check, no mutation pipeline and no status follow-up.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{DeleteParams, Preconditions, PropagationPolicy};
use tracing::{debug, info, instrument};

use vcsync_common::metrics::{operations, MetricsRecorder, OperationTimer};
use vcsync_common::{host_namespace, Error, TenantKey};

use crate::clients::HostCluster;
use crate::equality::check_pvc_equality;
use crate::projector::project_pvc;
use crate::queue::{EventKind, ReconcileAction, ReconcileRequest, Reconciler};

/// Reconciles tenant claims into host claims
pub struct PvcSyncer {
    host: Arc<dyn HostCluster>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl PvcSyncer {
    /// Create a reconciler writing to `host`
    pub fn new(host: Arc<dyn HostCluster>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { host, metrics }
    }

    /// Handle an Add event
    pub async fn reconcile_add(
        &self,
        key: &TenantKey,
        tenant: Arc<PersistentVolumeClaim>,
    ) -> Result<ReconcileAction, Error> {
        let host_ns = host_namespace(&key.cluster, &key.namespace)?;
        if tenant.metadata.deletion_timestamp.is_some()
            || self.host.get_pvc(&host_ns, &key.name).is_some()
        {
            return self.reconcile_update(key, tenant).await;
        }

        let pvc = project_pvc(&key.cluster, &host_ns, &tenant)?;
        match self.host.create_pvc(&host_ns, &pvc).await {
            Ok(_) => {
                info!(%key, host_namespace = %host_ns, "Created host claim");
                Ok(ReconcileAction::Done)
            }
            Err(e) if e.is_already_exists() => {
                debug!(%key, "Host claim already exists");
                Ok(ReconcileAction::Done)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle an Update event
    pub async fn reconcile_update(
        &self,
        key: &TenantKey,
        tenant: Arc<PersistentVolumeClaim>,
    ) -> Result<ReconcileAction, Error> {
        let host_ns = host_namespace(&key.cluster, &key.namespace)?;
        let Some(host) = self.host.get_pvc(&host_ns, &key.name) else {
            debug!(%key, "Host claim absent, nothing to update");
            return Ok(ReconcileAction::Done);
        };

        if tenant.metadata.deletion_timestamp.is_some() {
            if host.metadata.deletion_timestamp.is_some() {
                return Ok(ReconcileAction::Done);
            }
            let params = DeleteParams {
                grace_period_seconds: tenant
                    .metadata
                    .deletion_grace_period_seconds
                    .map(|s| s.max(0) as u32),
                preconditions: Some(Preconditions {
                    uid: host.metadata.uid.clone(),
                    resource_version: None,
                }),
                ..Default::default()
            };
            return match self.host.delete_pvc(&host_ns, &key.name, &params).await {
                Ok(()) => Ok(ReconcileAction::Done),
                Err(e) if e.is_not_found() => Ok(ReconcileAction::Done),
                Err(e) => Err(e),
            };
        }

        if let Some(candidate) = check_pvc_equality(&host, &tenant) {
            debug!(%key, "Converging host claim");
            self.host.update_pvc(&host_ns, &candidate).await?;
        }
        Ok(ReconcileAction::Done)
    }

    /// Handle a Delete event
    pub async fn reconcile_delete(&self, key: &TenantKey) -> Result<ReconcileAction, Error> {
        let host_ns = host_namespace(&key.cluster, &key.namespace)?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.host.delete_pvc(&host_ns, &key.name, &params).await {
            Ok(()) => {
                info!(%key, "Deleted host claim");
                Ok(ReconcileAction::Done)
            }
            Err(e) if e.is_not_found() => Ok(ReconcileAction::Done),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler<PersistentVolumeClaim> for PvcSyncer {
    #[instrument(skip(self, request), fields(key = %request.key, event = ?request.event))]
    async fn reconcile(
        &self,
        request: ReconcileRequest<PersistentVolumeClaim>,
    ) -> Result<ReconcileAction, Error> {
        let ReconcileRequest { key, event, object } = request;
        let operation = match event {
            EventKind::Add => operations::PVC_ADD,
            EventKind::Update => operations::PVC_UPDATE,
            EventKind::Delete => operations::PVC_DELETE,
        };
        let timer = OperationTimer::start(self.metrics.as_ref(), operation);
        let result = match event {
            EventKind::Add => self.reconcile_add(&key, object).await,
            EventKind::Update => self.reconcile_update(&key, object).await,
            EventKind::Delete => self.reconcile_delete(&key).await,
        };
        timer.finish(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockHostCluster;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;
    use vcsync_common::metrics::MetricsRecorder;
    use vcsync_common::BackReference;

    const HOST_NS: &str = "4-west-team-a";

    #[derive(Default)]
    struct Captured {
        records: Mutex<Vec<(String, bool)>>,
    }

    impl MetricsRecorder for Captured {
        fn record(&self, operation: &str, _duration: Duration, failed: bool) {
            self.records
                .lock()
                .expect("mutex should not be poisoned")
                .push((operation.to_string(), failed));
        }
    }

    fn claim(storage: &str) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some("data".to_string());
        pvc.metadata.namespace = Some("team-a".to_string());
        pvc.metadata.uid = Some("tenant-uid".to_string());
        pvc.spec = Some(PersistentVolumeClaimSpec {
            volume_name: Some("pv-tenant".to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        });
        pvc
    }

    fn request(event: EventKind, pvc: PersistentVolumeClaim) -> ReconcileRequest<PersistentVolumeClaim> {
        ReconcileRequest::new(TenantKey::new("west", "team-a", "data"), event, Arc::new(pvc))
    }

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from test"),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Story: redelivered Adds create one host claim
    #[tokio::test]
    async fn story_redelivered_add_creates_one_claim() {
        let store: Arc<Mutex<HashMap<String, Arc<PersistentVolumeClaim>>>> = Arc::default();
        let mut host = MockHostCluster::new();
        let cache = store.clone();
        host.expect_get_pvc().returning(move |_, name| {
            cache.lock().expect("mutex should not be poisoned").get(name).cloned()
        });
        let writes = store.clone();
        host.expect_create_pvc()
            .times(1)
            .returning(move |ns, pvc| {
                assert_eq!(ns, HOST_NS);
                writes
                    .lock()
                    .expect("mutex should not be poisoned")
                    .insert("data".to_string(), Arc::new(pvc.clone()));
                Ok(pvc.clone())
            });
        host.expect_update_pvc().never();
        let metrics = Arc::new(Captured::default());
        let syncer = PvcSyncer::new(Arc::new(host), metrics.clone());

        for _ in 0..2 {
            let action = syncer
                .reconcile(request(EventKind::Add, claim("1Gi")))
                .await
                .expect("add succeeds");
            assert_eq!(action, ReconcileAction::Done);
        }

        let stored = store.lock().expect("mutex should not be poisoned");
        let created = &stored["data"];
        assert!(created.spec.as_ref().and_then(|s| s.volume_name.as_ref()).is_none());
        assert!(BackReference::from_meta(&created.metadata).is_some());
        assert_eq!(
            *metrics.records.lock().expect("mutex should not be poisoned"),
            vec![("pvc_add".to_string(), false), ("pvc_add".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_expansion_is_applied() {
        let existing = Arc::new(
            project_pvc("west", HOST_NS, &claim("1Gi")).expect("projects"),
        );
        let mut host = MockHostCluster::new();
        host.expect_get_pvc().returning(move |_, _| Some(existing.clone()));
        host.expect_update_pvc()
            .withf(|_, pvc| {
                pvc.spec
                    .as_ref()
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .is_some_and(|r| r["storage"] == Quantity("5Gi".to_string()))
            })
            .times(1)
            .returning(|_, pvc| Ok(pvc.clone()));
        let syncer = PvcSyncer::new(Arc::new(host), Arc::new(vcsync_common::metrics::NoopMetrics));

        syncer
            .reconcile(request(EventKind::Update, claim("5Gi")))
            .await
            .expect("update succeeds");
    }

    #[tokio::test]
    async fn test_terminating_claim_deleted_with_precondition() {
        let mut existing = project_pvc("west", HOST_NS, &claim("1Gi")).expect("projects");
        existing.metadata.uid = Some("host-claim-uid".to_string());
        let existing = Arc::new(existing);

        let mut tenant = claim("1Gi");
        tenant.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));

        let mut host = MockHostCluster::new();
        host.expect_get_pvc().returning(move |_, _| Some(existing.clone()));
        host.expect_delete_pvc()
            .withf(|_, name, params| {
                name == "data"
                    && params.preconditions.as_ref().and_then(|p| p.uid.as_deref())
                        == Some("host-claim-uid")
            })
            .times(1)
            .returning(|_, _, _| Err(api_error(404, "NotFound")));
        let syncer = PvcSyncer::new(Arc::new(host), Arc::new(vcsync_common::metrics::NoopMetrics));

        let action = syncer
            .reconcile(request(EventKind::Update, tenant))
            .await
            .expect("not found is success");
        assert_eq!(action, ReconcileAction::Done);
    }

    #[tokio::test]
    async fn test_delete_failure_is_recorded() {
        let mut host = MockHostCluster::new();
        host.expect_delete_pvc()
            .returning(|_, _, _| Err(api_error(500, "InternalError")));
        let metrics = Arc::new(Captured::default());
        let syncer = PvcSyncer::new(Arc::new(host), metrics.clone());

        syncer
            .reconcile(request(EventKind::Delete, claim("1Gi")))
            .await
            .expect_err("server error");
        assert_eq!(
            *metrics.records.lock().expect("mutex should not be poisoned"),
            vec![("pvc_delete".to_string(), true)]
        );
    }
}
