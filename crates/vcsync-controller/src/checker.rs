//! Periodic consistency checker
//!
//! Each sweep runs in two phases:
//!
//! 1. One task per tenant cluster compares the tenant cache with the host
//!    cache. A missing host object is requeued as an Add (pods pinned to a
//!    node are skipped, they are never projected); a drifted one is
//!    repaired or only reported, per [`DriftPolicy`].
//! 2. After every phase 1 task has finished, host objects carrying a
//!    back-reference to a tenant object that no longer exists are deleted with
//!    a UID precondition.
//!
//! The barrier between the phases keeps the orphan sweep from deleting an
//! object whose tenant owner is only late to show up in a slow cluster cache.
//! A failure is logged and confined to its object or cluster; the next tick
//! retries it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, Preconditions};
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vcsync_common::metrics::{operations, MetricsRecorder, OperationTimer};
use vcsync_common::{host_namespace, BackReferenceIndex, Error, HostKey, TenantKey};

use crate::clients::{HostCluster, TenantClusters};
use crate::config::DriftPolicy;
use crate::equality::{check_pod_equality, check_pvc_equality};
use crate::pod::bypasses_scheduler;
use crate::queue::{EventKind, EventSink, ReconcileRequest};

/// Access to one resource kind on both sides, as the checker needs it
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Resource kind being checked
    type Object: Resource<DynamicType = ()> + Clone + Send + Sync + 'static;

    /// Kind name for logs
    const KIND: &'static str;

    /// Metrics label of one sweep
    const OPERATION: &'static str;

    /// Registered tenant clusters
    fn cluster_names(&self) -> Vec<String>;

    /// Tenant objects of a cluster, from its cache
    fn list_tenant(&self, cluster: &str) -> Result<Vec<Arc<Self::Object>>, Error>;

    /// One tenant object, from its cluster's cache
    fn get_tenant(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Self::Object>>, Error>;

    /// One host object, from the host cache
    fn get_host(&self, namespace: &str, name: &str) -> Option<Arc<Self::Object>>;

    /// All host objects, from the host cache
    fn list_host(&self) -> Vec<Arc<Self::Object>>;

    /// Whether a tenant object without a host copy should be requeued
    fn wants_host_copy(_tenant: &Self::Object) -> bool {
        true
    }

    /// Converged host candidate, or `None` when the host object matches
    fn converge(host: &Self::Object, tenant: &Self::Object) -> Option<Self::Object>;

    /// Write a converged candidate
    async fn update_host(&self, namespace: &str, object: &Self::Object) -> Result<(), Error>;

    /// Delete a host object
    async fn delete_host(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error>;

    /// Wait for the tenant and host caches to finish their initial list
    async fn wait_for_cache_sync(&self) -> Result<(), Error>;
}

/// Pods on both sides
pub struct PodProjection {
    tenants: Arc<dyn TenantClusters>,
    host: Arc<dyn HostCluster>,
}

impl PodProjection {
    /// Create the projection
    pub fn new(tenants: Arc<dyn TenantClusters>, host: Arc<dyn HostCluster>) -> Self {
        Self { tenants, host }
    }
}

#[async_trait]
impl Projection for PodProjection {
    type Object = Pod;
    const KIND: &'static str = "Pod";
    const OPERATION: &'static str = operations::POD_CHECK;

    fn cluster_names(&self) -> Vec<String> {
        self.tenants.cluster_names()
    }

    fn list_tenant(&self, cluster: &str) -> Result<Vec<Arc<Pod>>, Error> {
        self.tenants.list_pods(cluster)
    }

    fn get_tenant(&self, cluster: &str, namespace: &str, name: &str) -> Result<Option<Arc<Pod>>, Error> {
        self.tenants.get_pod(cluster, namespace, name)
    }

    fn get_host(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.host.get_pod(namespace, name)
    }

    fn list_host(&self) -> Vec<Arc<Pod>> {
        self.host.list_pods()
    }

    fn wants_host_copy(tenant: &Pod) -> bool {
        !bypasses_scheduler(tenant)
    }

    fn converge(host: &Pod, tenant: &Pod) -> Option<Pod> {
        check_pod_equality(host, tenant)
    }

    async fn update_host(&self, namespace: &str, object: &Pod) -> Result<(), Error> {
        self.host.update_pod(namespace, object).await.map(|_| ())
    }

    async fn delete_host(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<(), Error> {
        self.host.delete_pod(namespace, name, params).await
    }

    async fn wait_for_cache_sync(&self) -> Result<(), Error> {
        self.tenants.wait_for_cache_sync().await?;
        self.host.wait_for_cache_sync().await
    }
}

/// Claims on both sides
pub struct PvcProjection {
    tenants: Arc<dyn TenantClusters>,
    host: Arc<dyn HostCluster>,
}

impl PvcProjection {
    /// Create the projection
    pub fn new(tenants: Arc<dyn TenantClusters>, host: Arc<dyn HostCluster>) -> Self {
        Self { tenants, host }
    }
}

#[async_trait]
impl Projection for PvcProjection {
    type Object = PersistentVolumeClaim;
    const KIND: &'static str = "PersistentVolumeClaim";
    const OPERATION: &'static str = operations::PVC_CHECK;

    fn cluster_names(&self) -> Vec<String> {
        self.tenants.cluster_names()
    }

    fn list_tenant(&self, cluster: &str) -> Result<Vec<Arc<PersistentVolumeClaim>>, Error> {
        self.tenants.list_pvcs(cluster)
    }

    fn get_tenant(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<PersistentVolumeClaim>>, Error> {
        self.tenants.get_pvc(cluster, namespace, name)
    }

    fn get_host(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.host.get_pvc(namespace, name)
    }

    fn list_host(&self) -> Vec<Arc<PersistentVolumeClaim>> {
        self.host.list_pvcs()
    }

    fn converge(
        host: &PersistentVolumeClaim,
        tenant: &PersistentVolumeClaim,
    ) -> Option<PersistentVolumeClaim> {
        check_pvc_equality(host, tenant)
    }

    async fn update_host(&self, namespace: &str, object: &PersistentVolumeClaim) -> Result<(), Error> {
        self.host.update_pvc(namespace, object).await.map(|_| ())
    }

    async fn delete_host(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<(), Error> {
        self.host.delete_pvc(namespace, name, params).await
    }

    async fn wait_for_cache_sync(&self) -> Result<(), Error> {
        self.tenants.wait_for_cache_sync().await?;
        self.host.wait_for_cache_sync().await
    }
}

/// Per-object result of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// Tenant object without host projection; requeued as an Add
    Missing(TenantKey),
    /// Host projection differs from tenant intent
    Drifted(TenantKey),
    /// Host object whose tenant owner is gone
    Orphaned(HostKey),
    /// Host projection matches
    Match(TenantKey),
}

/// Outcome of one sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Findings of both phases
    pub findings: Vec<Finding>,
    /// Clusters whose phase 1 failed; their orphans were not collected
    pub failed_clusters: Vec<String>,
    /// The sweep stopped before phase 2
    pub cancelled: bool,
}

impl SweepReport {
    fn count(&self, pred: impl Fn(&Finding) -> bool) -> usize {
        self.findings.iter().filter(|f| pred(f)).count()
    }

    /// Number of tenant objects requeued for creation
    pub fn missing(&self) -> usize {
        self.count(|f| matches!(f, Finding::Missing(_)))
    }

    /// Number of drifted host objects
    pub fn drifted(&self) -> usize {
        self.count(|f| matches!(f, Finding::Drifted(_)))
    }

    /// Number of orphans found
    pub fn orphaned(&self) -> usize {
        self.count(|f| matches!(f, Finding::Orphaned(_)))
    }

    /// Number of converged objects
    pub fn matched(&self) -> usize {
        self.count(|f| matches!(f, Finding::Match(_)))
    }
}

/// Periodic two-phase sweep over one resource kind
pub struct ConsistencyChecker<P: Projection> {
    projection: Arc<P>,
    sink: Arc<dyn EventSink<P::Object>>,
    metrics: Arc<dyn MetricsRecorder>,
    policy: DriftPolicy,
    period: Duration,
}

impl<P: Projection> ConsistencyChecker<P> {
    /// Create a checker requeueing missing objects into `sink`
    pub fn new(
        projection: Arc<P>,
        sink: Arc<dyn EventSink<P::Object>>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            projection,
            sink,
            metrics,
            policy: DriftPolicy::default(),
            period: Duration::from_secs(60),
        }
    }

    /// Set the drift policy
    pub fn with_policy(mut self, policy: DriftPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the sweep period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sweep every period until `token` is cancelled
    ///
    /// No sweep starts before the caches have synced.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            synced = self.projection.wait_for_cache_sync() => synced?,
        }
        info!(kind = P::KIND, period_secs = self.period.as_secs(), policy = %self.policy, "Consistency checker started");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let report = self.sweep(&token).await;
            debug!(
                kind = P::KIND,
                missing = report.missing(),
                drifted = report.drifted(),
                orphaned = report.orphaned(),
                matched = report.matched(),
                "Consistency sweep finished"
            );
        }
        info!(kind = P::KIND, "Consistency checker stopped");
        Ok(())
    }

    /// Run one sweep
    pub async fn sweep(&self, token: &CancellationToken) -> SweepReport {
        let timer = OperationTimer::start(self.metrics.as_ref(), P::OPERATION);
        let report = self.sweep_inner(token).await;
        let outcome: Result<(), ()> = if report.failed_clusters.is_empty() {
            Ok(())
        } else {
            Err(())
        };
        timer.finish(&outcome);
        report
    }

    async fn sweep_inner(&self, token: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();
        let clusters = self.projection.cluster_names();
        if clusters.is_empty() {
            info!(kind = P::KIND, "No tenant clusters registered, skipping consistency check");
            return report;
        }

        let mut tasks = JoinSet::new();
        for cluster in clusters {
            let projection = self.projection.clone();
            let sink = self.sink.clone();
            let policy = self.policy;
            tasks.spawn(async move {
                let result = check_cluster(projection.as_ref(), sink.as_ref(), policy, &cluster).await;
                (cluster, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(findings))) => report.findings.extend(findings),
                Ok((cluster, Err(e))) => {
                    error!(kind = P::KIND, %cluster, error = %e, "Cluster consistency check failed");
                    report.failed_clusters.push(cluster);
                }
                Err(e) => error!(kind = P::KIND, error = %e, "Cluster consistency task panicked"),
            }
        }

        if token.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let failed: HashSet<&str> = report.failed_clusters.iter().map(String::as_str).collect();
        let orphans = self.collect_orphans(&failed).await;
        report.findings.extend(orphans);
        report
    }

    async fn collect_orphans(&self, skip: &HashSet<&str>) -> Vec<Finding> {
        let hosts = self.projection.list_host();
        let index = BackReferenceIndex::from_objects(
            hosts
                .iter()
                .filter(|o| o.meta().deletion_timestamp.is_none())
                .map(|o| o.as_ref()),
        );
        debug!(kind = P::KIND, count = index.len(), "Checking host objects for orphans");

        let mut orphans = Vec::new();
        for (owner, host) in index.iter() {
            if skip.contains(owner.cluster.as_str()) {
                continue;
            }
            // A terminating tenant owner still counts as live; its own
            // graceful delete removes the host copy.
            match self
                .projection
                .get_tenant(&owner.cluster, &owner.namespace, &owner.name)
            {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(kind = P::KIND, key = %owner, error = %e, "Cannot resolve tenant owner");
                    continue;
                }
            }

            let params = DeleteParams {
                preconditions: Some(Preconditions {
                    uid: host.uid.clone(),
                    resource_version: None,
                }),
                ..Default::default()
            };
            match self
                .projection
                .delete_host(&host.namespace, &host.name, &params)
                .await
            {
                Ok(()) => info!(kind = P::KIND, namespace = %host.namespace, name = %host.name, "Deleted orphaned host object"),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!(
                    kind = P::KIND,
                    namespace = %host.namespace,
                    name = %host.name,
                    error = %e,
                    "Failed to delete orphaned host object"
                ),
            }
            orphans.push(Finding::Orphaned(host.clone()));
        }
        orphans
    }
}

async fn check_cluster<P: Projection>(
    projection: &P,
    sink: &dyn EventSink<P::Object>,
    policy: DriftPolicy,
    cluster: &str,
) -> Result<Vec<Finding>, Error> {
    let objects = projection.list_tenant(cluster)?;
    debug!(kind = P::KIND, cluster, count = objects.len(), "Checking tenant cluster");

    let mut findings = Vec::with_capacity(objects.len());
    for tenant in objects {
        let namespace = tenant.namespace().unwrap_or_default();
        let key = TenantKey::new(cluster, namespace.as_str(), tenant.name_any());
        let host_ns = match host_namespace(cluster, &namespace) {
            Ok(ns) => ns,
            Err(e) => {
                warn!(kind = P::KIND, %key, error = %e, "Tenant object cannot be mapped");
                continue;
            }
        };

        let Some(host) = projection.get_host(&host_ns, &key.name) else {
            if !P::wants_host_copy(&tenant) {
                debug!(kind = P::KIND, %key, "Tenant object is never projected, skipping");
                continue;
            }
            debug!(kind = P::KIND, %key, "Host object missing, requeueing");
            sink.enqueue(ReconcileRequest::new(key.clone(), EventKind::Add, tenant));
            findings.push(Finding::Missing(key));
            continue;
        };

        let Some(candidate) = P::converge(&host, &tenant) else {
            findings.push(Finding::Match(key));
            continue;
        };
        match policy {
            DriftPolicy::Repair => {
                if let Err(e) = projection.update_host(&host_ns, &candidate).await {
                    warn!(kind = P::KIND, %key, error = %e, "Failed to repair drifted host object");
                } else {
                    info!(kind = P::KIND, %key, "Repaired drifted host object");
                }
            }
            DriftPolicy::LogOnly => {
                warn!(kind = P::KIND, %key, "Host object differs from tenant object");
            }
        }
        findings.push(Finding::Drifted(key));
    }
    Ok(findings)
}
