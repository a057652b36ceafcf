//! Pod downward reconciler
//!
//! State per key is implicit in host pod existence plus the deletion marks on
//! both sides. Add creates the host pod (or degrades to Update when the host
//! pod already exists or the tenant pod is terminating), Update converges or
//! deletes it, Delete removes it unconditionally.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{DeleteParams, Preconditions, PropagationPolicy};
use tracing::{debug, info, instrument, warn};

use vcsync_common::events::reasons;
use vcsync_common::metrics::{operations, MetricsRecorder, OperationTimer};
use vcsync_common::{
    host_namespace, Error, TenantKey, LABEL_SYNC_STATUS, MASTER_SERVICE_NAMESPACE,
    SYNC_STATUS_READY, TENANT_DNS_SERVER_NAMESPACE, TENANT_DNS_SERVER_SERVICE,
};

use crate::clients::{HostCluster, TenantClusters};
use crate::config::SyncerConfig;
use crate::equality::check_pod_equality;
use crate::kubeconfig;
use crate::mutate::envvars::service_ip;
use crate::mutate::{
    self, AutomountMutator, DefaultMutator, ExtensionMetaMutator, KubeconfigMutator,
    PodMutateContext, PodMutator, SideData,
};
use crate::projector::project_pod;
use crate::queue::{EventKind, ReconcileAction, ReconcileRequest, Reconciler};
use crate::vnode::VNodePodMap;

/// Service account used when a pod names none
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Warning recorded against tenant pods that set `nodeName` themselves
pub const NODE_NAME_NOT_SUPPORTED: &str =
    "The Pod has nodeName set in the spec which is not supported for now";

/// Reconciles tenant pods into host pods
pub struct PodSyncer {
    tenants: Arc<dyn TenantClusters>,
    host: Arc<dyn HostCluster>,
    config: SyncerConfig,
    metrics: Arc<dyn MetricsRecorder>,
    vnodes: VNodePodMap,
}

impl PodSyncer {
    /// Create a reconciler over the given clusters
    pub fn new(
        tenants: Arc<dyn TenantClusters>,
        host: Arc<dyn HostCluster>,
        config: SyncerConfig,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            tenants,
            host,
            config,
            metrics,
            vnodes: VNodePodMap::new(),
        }
    }

    fn mutators(&self, kubeconfig_secret: Option<String>) -> Vec<Box<dyn PodMutator>> {
        let mut mutators: Vec<Box<dyn PodMutator>> = vec![
            Box::new(DefaultMutator),
            Box::new(AutomountMutator::new(self.config.disable_service_account_token)),
            Box::new(ExtensionMetaMutator::new(self.tenants.clone())),
        ];
        if let Some(secret) = kubeconfig_secret {
            mutators.push(Box::new(KubeconfigMutator::new(
                secret,
                self.config.tenant_kubeconfig_mount_path.clone(),
            )));
        }
        mutators
    }

    /// Handle an Add event
    pub async fn reconcile_add(
        &self,
        key: &TenantKey,
        tenant: Arc<Pod>,
    ) -> Result<ReconcileAction, Error> {
        let host_ns = host_namespace(&key.cluster, &key.namespace)?;

        if tenant.metadata.deletion_timestamp.is_some()
            || self.host.get_pod(&host_ns, &key.name).is_some()
        {
            return self.reconcile_update(key, tenant).await;
        }

        if bypasses_scheduler(&tenant) {
            info!(%key, "Rejecting pod with nodeName set");
            self.tenants
                .publish_warning(
                    &key.cluster,
                    &tenant,
                    reasons::NOT_SUPPORTED,
                    NODE_NAME_NOT_SUPPORTED,
                )
                .await;
            return Ok(ReconcileAction::Done);
        }

        let mut pod = project_pod(&key.cluster, &host_ns, &tenant)?;
        let service_account = tenant
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());
        if let Some(spec) = pod.spec.as_mut() {
            spec.service_account_name = Some(service_account.clone());
        }

        let host_secret = self.ready_host_secret(&host_ns, &service_account).await?;
        let tenant_secret = self
            .tenants
            .service_account_secret(&key.cluster, &key.namespace, &service_account)
            .await?
            .ok_or_else(|| {
                Error::not_ready(
                    "Secret",
                    format!("{}/{}", key.namespace, service_account),
                    "tenant service account has no token secret",
                )
            })?;

        let services = self.visible_services(&key.cluster, &host_ns)?;
        let name_server = self.name_server(&key.cluster).await?;
        let cluster_domain = self.tenants.cluster_domain(&key.cluster)?;

        let credential = if self.config.enable_tenant_kubeconfig {
            let config = kubeconfig::for_service_account(
                self.tenants.as_ref(),
                &key.cluster,
                &key.namespace,
                &service_account,
            )
            .await?;
            Some(kubeconfig::build_secret(&key.cluster, &host_ns, &tenant, config)?)
        } else {
            None
        };

        let mut ctx = PodMutateContext {
            cluster: key.cluster.clone(),
            tenant: tenant.clone(),
            pod,
            side: SideData {
                services,
                tenant_secret: secret_name(&tenant_secret),
                host_secret: secret_name(&host_secret),
                name_server,
                cluster_domain,
            },
        };
        let mutators = self.mutators(credential.as_ref().map(secret_name));
        mutate::mutate(&mut ctx, &mutators).await?;

        if let Some(secret) = credential.as_ref() {
            match self.host.create_secret(&host_ns, secret).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(%key, secret = %secret_name(secret), "Kubeconfig secret already exists")
                }
                Err(e) => return Err(e),
            }
        }

        let created = match self.host.create_pod(&host_ns, &ctx.pod).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                debug!(%key, "Host pod already exists");
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(e),
        };
        info!(%key, host_namespace = %host_ns, "Created host pod");

        if let Some(secret) = credential.as_ref() {
            self.bind_secret_to_pod(&host_ns, &secret_name(secret), &created)
                .await;
        }
        Ok(ReconcileAction::Done)
    }

    /// Handle an Update event
    pub async fn reconcile_update(
        &self,
        key: &TenantKey,
        tenant: Arc<Pod>,
    ) -> Result<ReconcileAction, Error> {
        let host_ns = host_namespace(&key.cluster, &key.namespace)?;
        let Some(host) = self.host.get_pod(&host_ns, &key.name) else {
            // recreation is left to the consistency checker
            debug!(%key, "Host pod absent, nothing to update");
            return Ok(ReconcileAction::Done);
        };

        if tenant.metadata.deletion_timestamp.is_some() {
            if host.metadata.deletion_timestamp.is_some() {
                debug!(%key, "Host pod already terminating");
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
            return match self.host.delete_pod(&host_ns, &key.name, &params).await {
                Ok(()) => {
                    info!(%key, "Deleting host pod of terminating tenant pod");
                    Ok(ReconcileAction::Done)
                }
                Err(e) if e.is_not_found() => Ok(ReconcileAction::Done),
                Err(e) => Err(e),
            };
        }

        let host = match check_pod_equality(&host, &tenant) {
            Some(candidate) => {
                debug!(%key, "Converging host pod");
                Arc::new(self.host.update_pod(&host_ns, &candidate).await?)
            }
            None => host,
        };

        if tenant.status != host.status {
            return Ok(ReconcileAction::Requeue);
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
        match self.host.delete_pod(&host_ns, &key.name, &params).await {
            Ok(()) => {
                info!(%key, "Deleted host pod");
                Ok(ReconcileAction::Done)
            }
            Err(e) if e.is_not_found() => Ok(ReconcileAction::Done),
            Err(e) => Err(e),
        }
    }

    async fn ready_host_secret(&self, host_ns: &str, service_account: &str) -> Result<Secret, Error> {
        let secret = self
            .host
            .service_account_secret(host_ns, service_account)
            .await?
            .ok_or_else(|| {
                Error::not_ready(
                    "Secret",
                    format!("{host_ns}/{service_account}"),
                    "service account token is not projected yet",
                )
            })?;
        let ready = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SYNC_STATUS))
            .is_some_and(|status| status == SYNC_STATUS_READY);
        if !ready {
            return Err(Error::not_ready(
                "Secret",
                secret_name(&secret),
                "service account token projection is not ready",
            ));
        }
        Ok(secret)
    }

    /// Host services of the virtual API server namespace and the pod's own namespace
    fn visible_services(&self, cluster: &str, host_ns: &str) -> Result<Vec<Arc<Service>>, Error> {
        let master_ns = host_namespace(cluster, MASTER_SERVICE_NAMESPACE)?;
        let mut services = self.host.list_services(&master_ns);
        if master_ns != host_ns {
            services.extend(self.host.list_services(host_ns));
        }
        if services.is_empty() {
            return Err(Error::not_ready("Service", host_ns, "service is not ready"));
        }
        Ok(services)
    }

    async fn name_server(&self, cluster: &str) -> Result<Option<String>, Error> {
        let namespace = host_namespace(cluster, TENANT_DNS_SERVER_NAMESPACE)?;
        let service = self
            .host
            .get_service(&namespace, TENANT_DNS_SERVER_SERVICE)
            .await?;
        Ok(service.as_ref().and_then(service_ip).map(str::to_string))
    }

    async fn bind_secret_to_pod(&self, host_ns: &str, secret: &str, host_pod: &Pod) {
        let Some(owner) = kubeconfig::owner_reference(host_pod) else {
            warn!(namespace = host_ns, secret, "Created host pod has no identity, kubeconfig secret left unowned");
            return;
        };
        if let Err(e) = self.host.add_secret_owner(host_ns, secret, &owner).await {
            warn!(namespace = host_ns, secret, error = %e, "Failed to bind kubeconfig secret to host pod");
        }
    }
}

#[async_trait]
impl Reconciler<Pod> for PodSyncer {
    #[instrument(skip(self, request), fields(key = %request.key, event = ?request.event))]
    async fn reconcile(&self, request: ReconcileRequest<Pod>) -> Result<ReconcileAction, Error> {
        let ReconcileRequest { key, event, object } = request;
        let drained = match event {
            EventKind::Delete => self.vnodes.forget(&key),
            EventKind::Add | EventKind::Update => self.vnodes.observe(&key, &object),
        };
        if let Some(node) = drained {
            info!(cluster = %key.cluster, node, "Tenant node has no synced pods left");
        }

        let operation = match event {
            EventKind::Add => operations::POD_ADD,
            EventKind::Update => operations::POD_UPDATE,
            EventKind::Delete => operations::POD_DELETE,
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

/// A pod pinned to a node without going through the scheduler
pub(crate) fn bypasses_scheduler(pod: &Pod) -> bool {
    let pinned = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| !n.is_empty());
    let scheduled = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "PodScheduled" && c.status == "True");
    pinned && !scheduled
}

fn secret_name(secret: &Secret) -> String {
    secret.metadata.name.clone().unwrap_or_default()
}
