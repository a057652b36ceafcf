//! vc-syncer - downward syncer from tenant clusters into the host cluster

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use tokio_util::sync::CancellationToken;

use vcsync_common::kube_utils::{certificate_authority_from_file, create_client};
use vcsync_common::metrics::{MetricsRecorder, OperationMetrics};
use vcsync_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use vcsync_common::{TenantKey, SYNCER_NAME};
use vcsync_controller::clients::{TenantRegistration, TenantWatch};
use vcsync_controller::config::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_KUBECONFIG_MOUNT_PATH};
use vcsync_controller::{
    ConsistencyChecker, DriftPolicy, EventSink, HostCluster, KubeHostCluster, KubeTenantClusters,
    PodProjection, PodSyncer, PvcProjection, PvcSyncer, SyncerConfig, TenantClusters,
    TenantEventSource, WorkQueue,
};

/// Syncs pods and claims of virtual clusters into the host cluster
#[derive(Parser, Debug)]
#[command(name = "vc-syncer", version, about, long_about = None)]
struct Cli {
    /// Kubeconfig of the host cluster (in-cluster config when omitted)
    #[arg(long, env = "VCSYNC_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Tenant cluster as NAME=KUBECONFIG[,DOMAIN], repeatable
    #[arg(long = "tenant", env = "VCSYNC_TENANTS", value_delimiter = ';')]
    tenants: Vec<TenantArg>,

    /// Disable service account token automount on every host pod
    #[arg(long, env = "VCSYNC_DISABLE_SERVICE_ACCOUNT_TOKEN")]
    disable_service_account_token: bool,

    /// Mount a kubeconfig for the tenant API server into host pods
    #[arg(long, env = "VCSYNC_ENABLE_TENANT_KUBECONFIG")]
    enable_tenant_kubeconfig: bool,

    /// Mount path of the tenant kubeconfig inside host pods
    #[arg(long, env = "VCSYNC_TENANT_KUBECONFIG_MOUNT_PATH", default_value = DEFAULT_KUBECONFIG_MOUNT_PATH)]
    tenant_kubeconfig_mount_path: String,

    /// Seconds between consistency sweeps
    #[arg(long, env = "VCSYNC_CHECKER_PERIOD", default_value_t = 60)]
    checker_period: u64,

    /// Drift handling for pods: repair or log-only
    #[arg(long, env = "VCSYNC_POD_DRIFT_POLICY", default_value_t = DriftPolicy::Repair)]
    pod_drift_policy: DriftPolicy,

    /// Drift handling for claims: repair or log-only
    #[arg(long, env = "VCSYNC_PVC_DRIFT_POLICY", default_value_t = DriftPolicy::LogOnly)]
    pvc_drift_policy: DriftPolicy,

    /// Concurrent reconciles per resource kind
    #[arg(long, env = "VCSYNC_WORKERS", default_value_t = 8)]
    workers: usize,

    /// DNS domain for tenants registered without one
    #[arg(long, env = "VCSYNC_DEFAULT_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    default_cluster_domain: String,

    /// Log line format: json or text
    #[arg(long, env = "VCSYNC_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_format: self.log_format,
            tenant_clusters: self.tenants.len(),
            ..TelemetryConfig::default()
        }
    }

    fn syncer_config(&self) -> SyncerConfig {
        SyncerConfig {
            disable_service_account_token: self.disable_service_account_token,
            enable_tenant_kubeconfig: self.enable_tenant_kubeconfig,
            tenant_kubeconfig_mount_path: self.tenant_kubeconfig_mount_path.clone(),
            checker_period: Duration::from_secs(self.checker_period.max(1)),
            pod_drift_policy: self.pod_drift_policy,
            pvc_drift_policy: self.pvc_drift_policy,
            workers: self.workers.max(1),
            default_cluster_domain: self.default_cluster_domain.clone(),
        }
    }
}

/// One `--tenant` flag
#[derive(Debug, Clone, PartialEq)]
struct TenantArg {
    name: String,
    kubeconfig: PathBuf,
    domain: Option<String>,
}

impl FromStr for TenantArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=KUBECONFIG[,DOMAIN], got {s:?}"))?;
        let (path, domain) = match rest.split_once(',') {
            Some((path, domain)) => (path, Some(domain.trim().to_string())),
            None => (rest, None),
        };
        if name.trim().is_empty() || path.trim().is_empty() {
            return Err(format!("tenant name and kubeconfig must be non-empty in {s:?}"));
        }
        Ok(Self {
            name: name.trim().to_string(),
            kubeconfig: PathBuf::from(path.trim()),
            domain: domain.filter(|d| !d.is_empty()),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.telemetry_config())?;

    let config = cli.syncer_config();
    let metrics: Arc<dyn MetricsRecorder> = Arc::new(OperationMetrics::register(
        &opentelemetry::global::meter(SYNCER_NAME),
    ));
    let token = CancellationToken::new();

    let host_client = create_client(cli.kubeconfig.as_deref()).await?;
    let host = Arc::new(KubeHostCluster::spawn(host_client, token.clone()));

    let (tenants, watches) = register_tenants(&cli.tenants, &config).await?;
    if watches.is_empty() {
        tracing::warn!("No tenant clusters registered, syncer will stay idle");
    }
    let tenants = Arc::new(tenants);

    let pod_queue = Arc::new(WorkQueue::<Pod>::new("pods", config.workers).with_refresh({
        let tenants = tenants.clone();
        Arc::new(move |key: &TenantKey| {
            tenants
                .get_pod(&key.cluster, &key.namespace, &key.name)
                .ok()
                .flatten()
        })
    }));
    let pvc_queue = Arc::new(
        WorkQueue::<PersistentVolumeClaim>::new("pvcs", config.workers).with_refresh({
            let tenants = tenants.clone();
            Arc::new(move |key: &TenantKey| {
                tenants
                    .get_pvc(&key.cluster, &key.namespace, &key.name)
                    .ok()
                    .flatten()
            })
        }),
    );

    // Tenant caches are fed by the event source, so it starts before the sync wait.
    let source = tokio::spawn(TenantEventSource::new(watches).run(
        pod_queue.clone() as Arc<dyn EventSink<Pod>>,
        pvc_queue.clone() as Arc<dyn EventSink<PersistentVolumeClaim>>,
        token.clone(),
    ));

    tracing::info!("Waiting for cache sync...");
    tokio::select! {
        synced = async {
            host.wait_for_cache_sync().await?;
            tenants.wait_for_cache_sync().await
        } => synced?,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested before caches synced");
            token.cancel();
            let _ = source.await;
            return Ok(());
        }
    }

    let pod_syncer = Arc::new(PodSyncer::new(
        tenants.clone(),
        host.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let pvc_syncer = Arc::new(PvcSyncer::new(host.clone(), metrics.clone()));

    let pod_checker = ConsistencyChecker::new(
        Arc::new(PodProjection::new(tenants.clone(), host.clone())),
        pod_queue.clone(),
        metrics.clone(),
    )
    .with_policy(config.pod_drift_policy)
    .with_period(config.checker_period);
    let pvc_checker = ConsistencyChecker::new(
        Arc::new(PvcProjection::new(tenants.clone(), host.clone())),
        pvc_queue.clone(),
        metrics.clone(),
    )
    .with_policy(config.pvc_drift_policy)
    .with_period(config.checker_period);

    tracing::info!(
        workers = config.workers,
        checker_period = ?config.checker_period,
        "Starting syncer"
    );
    tracing::info!("  - pod work queue and consistency checker");
    tracing::info!("  - claim work queue and consistency checker");

    let pod_worker = tokio::spawn(pod_queue.run(pod_syncer, token.clone()));
    let pvc_worker = tokio::spawn(pvc_queue.run(pvc_syncer, token.clone()));
    let pod_sweeper = tokio::spawn({
        let token = token.clone();
        async move { pod_checker.run(token).await }
    });
    let pvc_sweeper = tokio::spawn({
        let token = token.clone();
        async move { pvc_checker.run(token).await }
    });

    shutdown_signal().await;
    tracing::info!("Shutdown requested, draining in-flight work");
    token.cancel();

    let (source, pod_worker, pvc_worker, pod_sweeper, pvc_sweeper) =
        tokio::join!(source, pod_worker, pvc_worker, pod_sweeper, pvc_sweeper);
    for joined in [source, pod_worker, pvc_worker] {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Syncer task panicked");
        }
    }
    for joined in [pod_sweeper, pvc_sweeper] {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Consistency checker stopped with error"),
            Err(e) => tracing::error!(error = %e, "Consistency checker panicked"),
        }
    }

    tracing::info!("vc-syncer shutting down");
    Ok(())
}

/// Build clients for every `--tenant` flag and register them
async fn register_tenants(
    args: &[TenantArg],
    config: &SyncerConfig,
) -> anyhow::Result<(KubeTenantClusters, Vec<TenantWatch>)> {
    let mut tenants = KubeTenantClusters::new();
    let mut watches = Vec::with_capacity(args.len());
    for arg in args {
        let certificate_authority = certificate_authority_from_file(&arg.kubeconfig)
            .map_err(|e| anyhow::anyhow!("Tenant {}: {}", arg.name, e))?;
        let client = create_client(Some(&arg.kubeconfig)).await?;
        watches.push(tenants.register(TenantRegistration {
            name: arg.name.clone(),
            client,
            domain: arg
                .domain
                .clone()
                .unwrap_or_else(|| config.default_cluster_domain.clone()),
            certificate_authority,
        })?);
    }
    Ok((tenants, watches))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_flag_with_domain() {
        let arg: TenantArg = "west=/etc/vc/west.yaml,west.local".parse().expect("parses");
        assert_eq!(
            arg,
            TenantArg {
                name: "west".to_string(),
                kubeconfig: PathBuf::from("/etc/vc/west.yaml"),
                domain: Some("west.local".to_string()),
            }
        );
    }

    #[test]
    fn test_tenant_flag_without_domain() {
        let arg: TenantArg = "east=/etc/vc/east.yaml".parse().expect("parses");
        assert_eq!(arg.domain, None);
        assert!("east".parse::<TenantArg>().is_err());
        assert!("=/etc/vc/east.yaml".parse::<TenantArg>().is_err());
    }

    #[test]
    fn test_cli_builds_syncer_config() {
        let cli = Cli::try_parse_from([
            "vc-syncer",
            "--tenant",
            "west=/etc/vc/west.yaml",
            "--tenant",
            "east=/etc/vc/east.yaml,east.local",
            "--enable-tenant-kubeconfig",
            "--pvc-drift-policy",
            "repair",
            "--workers",
            "0",
        ])
        .expect("parses");
        assert_eq!(cli.tenants.len(), 2);

        let config = cli.syncer_config();
        assert!(config.enable_tenant_kubeconfig);
        assert!(!config.disable_service_account_token);
        assert_eq!(config.pod_drift_policy, DriftPolicy::Repair);
        assert_eq!(config.pvc_drift_policy, DriftPolicy::Repair);
        assert_eq!(config.workers, 1);
        assert_eq!(config.checker_period, Duration::from_secs(60));
        assert_eq!(config.default_cluster_domain, "cluster.local");
    }

    #[test]
    fn test_cli_builds_telemetry_config() {
        let cli = Cli::try_parse_from([
            "vc-syncer",
            "--tenant",
            "west=/etc/vc/west.yaml",
            "--log-format",
            "text",
        ])
        .expect("parses");

        let telemetry = cli.telemetry_config();
        assert_eq!(telemetry.log_format, LogFormat::Text);
        assert_eq!(telemetry.tenant_clusters, 1);
        assert_eq!(telemetry.service_name, SYNCER_NAME);

        assert!(Cli::try_parse_from(["vc-syncer", "--log-format", "yaml"]).is_err());
    }
}
