//! Common types for the virtual cluster syncer: errors, namespace mapping,
//! metrics, events and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod namespace;
pub mod telemetry;

pub use error::Error;
pub use namespace::{host_namespace, BackReference, BackReferenceIndex, HostKey, TenantKey};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation on host objects naming the owning tenant cluster
pub const ANNOTATION_CLUSTER: &str = "tenancy.x-k8s.io/cluster";

/// Annotation on host objects naming the owning tenant namespace
pub const ANNOTATION_NAMESPACE: &str = "tenancy.x-k8s.io/namespace";

/// Annotation on host objects recording the UID of the tenant object
pub const ANNOTATION_TENANT_UID: &str = "tenancy.x-k8s.io/uid";

/// Annotation on host objects carrying the tenant owner references as JSON
pub const ANNOTATION_OWNER_REFERENCES: &str = "tenancy.x-k8s.io/owner-references";

/// Prefix reserved for keys the syncer owns on host objects
pub const SYNCER_KEY_PREFIX: &str = "tenancy.x-k8s.io/";

/// Label on host pods naming the tenant Deployment that owns the pod's ReplicaSet
pub const LABEL_EXTEND_DEPLOYMENT_NAME: &str = "tenancy.x-k8s.io/extend.deployment.name";

/// Label on host pods carrying the UID of the tenant Deployment
pub const LABEL_EXTEND_DEPLOYMENT_UID: &str = "tenancy.x-k8s.io/extend.deployment.uid";

/// Label on host-projected secrets reporting projection progress
pub const LABEL_SYNC_STATUS: &str = "tenancy.x-k8s.io/sync-status";

/// Value of [`LABEL_SYNC_STATUS`] once a secret projection is complete
pub const SYNC_STATUS_READY: &str = "ready";

/// Annotation on host-projected secrets naming the tenant service account
pub const ANNOTATION_SERVICE_ACCOUNT_NAME: &str = "kubernetes.io/service-account.name";

/// Tenant namespace holding the virtual API server service
pub const MASTER_SERVICE_NAMESPACE: &str = "default";

/// Name of the virtual API server service
pub const MASTER_SERVICE_NAME: &str = "kubernetes";

/// Tenant namespace holding the cluster DNS service
pub const TENANT_DNS_SERVER_NAMESPACE: &str = "kube-system";

/// Name of the cluster DNS service
pub const TENANT_DNS_SERVER_SERVICE: &str = "kube-dns";

/// Field manager / reporting controller name
pub const SYNCER_NAME: &str = "vc-syncer";
