//! Downward synchronization of tenant objects into the host cluster
//!
//! Tenant pods and claims are projected into host namespaces, mutated so that
//! they behave inside the host as they would inside the tenant cluster, and
//! kept converged by an event-driven reconciler plus a periodic consistency
//! checker that self-heals missed creations and collects orphans.

pub mod checker;
pub mod clients;
pub mod config;
pub mod equality;
pub mod kubeconfig;
pub mod mutate;
pub mod pod;
pub mod projector;
pub mod pvc;
pub mod queue;
pub mod source;
pub mod vnode;

pub use checker::{ConsistencyChecker, Finding, PodProjection, Projection, PvcProjection, SweepReport};
pub use clients::{HostCluster, KubeHostCluster, KubeTenantClusters, TenantClusters};
pub use config::{DriftPolicy, SyncerConfig};
pub use pod::PodSyncer;
pub use pvc::PvcSyncer;
pub use queue::{EventKind, EventSink, ReconcileAction, ReconcileRequest, Reconciler, WorkQueue};
pub use source::TenantEventSource;
pub use vnode::VNodePodMap;
