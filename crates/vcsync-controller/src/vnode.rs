//! Placement hints: which tenant pods sit on which tenant node
//!
//! Updated on every pod reconcile. Updates for one cluster can race each other
//! (different keys reconcile in parallel) so the map carries its own locking.
//! A tenant node whose last pod goes away is reported so it can be reclaimed.

use std::collections::HashSet;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;

use vcsync_common::TenantKey;

/// Per-cluster map from tenant node name to the tenant pods placed on it
#[derive(Debug, Default)]
pub struct VNodePodMap {
    nodes: DashMap<(String, String), HashSet<TenantKey>>,
}

impl VNodePodMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current placement of a tenant pod
    ///
    /// A pod without a node, or one moved to another node, is removed from
    /// its previous entry. Returns the node left without pods, if any.
    pub fn observe(&self, key: &TenantKey, pod: &Pod) -> Option<String> {
        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        let drained = self.remove_except(key, node);
        if let Some(node) = node {
            self.nodes
                .entry((key.cluster.clone(), node.to_string()))
                .or_default()
                .insert(key.clone());
        }
        drained
    }

    /// Forget a tenant pod, returning the node left without pods, if any
    pub fn forget(&self, key: &TenantKey) -> Option<String> {
        self.remove_except(key, None)
    }

    fn remove_except(&self, key: &TenantKey, keep: Option<&str>) -> Option<String> {
        let mut drained = None;
        self.nodes.retain(|(cluster, node), pods| {
            if cluster == &key.cluster
                && Some(node.as_str()) != keep
                && pods.remove(key)
                && pods.is_empty()
            {
                drained = Some(node.clone());
            }
            !pods.is_empty()
        });
        drained
    }

    /// Tenant pods on a node
    #[cfg(test)]
    pub(crate) fn pods_on(&self, cluster: &str, node: &str) -> Vec<TenantKey> {
        let mut pods: Vec<TenantKey> = self
            .nodes
            .get(&(cluster.to_string(), node.to_string()))
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default();
        pods.sort();
        pods
    }
}
