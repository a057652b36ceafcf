//! Runtime configuration consumed by the reconcilers and checkers

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use vcsync_common::Error;

/// Default mount path of the tenant kubeconfig inside host pods
pub const DEFAULT_KUBECONFIG_MOUNT_PATH: &str = "/var/run/secrets/vc/kubeconfig";

/// Default DNS domain for tenant clusters that do not declare one
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// What the consistency checker does with a drifted host object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriftPolicy {
    /// Update the host object to the converged candidate
    #[default]
    Repair,
    /// Only report the drift
    LogOnly,
}

impl fmt::Display for DriftPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftPolicy::Repair => write!(f, "repair"),
            DriftPolicy::LogOnly => write!(f, "log-only"),
        }
    }
}

impl FromStr for DriftPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repair" => Ok(DriftPolicy::Repair),
            "log-only" | "log" => Ok(DriftPolicy::LogOnly),
            other => Err(Error::validation(format!(
                "unknown drift policy {other:?}, expected repair or log-only"
            ))),
        }
    }
}

/// Syncer configuration
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Force `automountServiceAccountToken: false` on every host pod
    pub disable_service_account_token: bool,
    /// Mount a kubeconfig for the tenant API server into every host pod
    pub enable_tenant_kubeconfig: bool,
    /// Where the tenant kubeconfig volume is mounted
    pub tenant_kubeconfig_mount_path: String,
    /// Period of the consistency checkers
    pub checker_period: Duration,
    /// Drift handling for pods
    pub pod_drift_policy: DriftPolicy,
    /// Drift handling for claims
    pub pvc_drift_policy: DriftPolicy,
    /// Concurrent reconciles per resource kind
    pub workers: usize,
    /// DNS domain for tenant clusters registered without one
    pub default_cluster_domain: String,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            disable_service_account_token: false,
            enable_tenant_kubeconfig: false,
            tenant_kubeconfig_mount_path: DEFAULT_KUBECONFIG_MOUNT_PATH.to_string(),
            checker_period: Duration::from_secs(60),
            pod_drift_policy: DriftPolicy::Repair,
            pvc_drift_policy: DriftPolicy::LogOnly,
            workers: 8,
            default_cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }
}
