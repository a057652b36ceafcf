//! Namespace identity mapping between tenant clusters and the host cluster
//!
//! Every tenant namespace is projected into exactly one host namespace:
//!
//! ```text
//! host_namespace("west", "team-a") == "4-west-team-a"
//! ```
//!
//! The decimal length prefix makes the encoding uniquely decodable, so no two
//! distinct `(cluster, namespace)` pairs ever share a host namespace even when
//! cluster names contain dashes. The format is the sole addressing scheme for
//! host objects and must not change between releases.
//!
//! Host objects also carry a [`BackReference`] marker naming their tenant
//! owner. It is a weak reference used for reverse lookup only; the host never
//! cascades deletes through it.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::{Error, Result, ANNOTATION_CLUSTER, ANNOTATION_NAMESPACE};

/// Maximum length of a Kubernetes namespace name
const MAX_NAMESPACE_LEN: usize = 63;

fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAMESPACE_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// Map a tenant `(cluster, namespace)` pair to its host namespace
pub fn host_namespace(cluster: &str, namespace: &str) -> Result<String> {
    if !is_dns_label(cluster) {
        return Err(Error::validation_for_field(
            "cluster",
            format!("cluster name {cluster:?} is not a DNS label"),
        ));
    }
    if !is_dns_label(namespace) {
        return Err(Error::validation_for_field(
            "metadata.namespace",
            format!("namespace {namespace:?} is not a DNS label"),
        ));
    }

    let mapped = format!("{}-{}-{}", cluster.len(), cluster, namespace);
    if mapped.len() > MAX_NAMESPACE_LEN {
        return Err(Error::validation_for_field(
            "metadata.namespace",
            format!(
                "host namespace for {cluster}/{namespace} would be {} characters, limit is {MAX_NAMESPACE_LEN}",
                mapped.len()
            ),
        ));
    }
    Ok(mapped)
}

/// Weak back-reference from a host object to its tenant owner
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackReference {
    /// Tenant cluster name
    pub cluster: String,
    /// Tenant namespace
    pub namespace: String,
}

impl BackReference {
    /// Create a back-reference to the given tenant cluster and namespace
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
        }
    }

    /// Read the marker from host object metadata
    ///
    /// Objects missing either half of the marker are not managed by the syncer.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let annotations = meta.annotations.as_ref()?;
        let cluster = annotations.get(ANNOTATION_CLUSTER).filter(|c| !c.is_empty())?;
        let namespace = annotations
            .get(ANNOTATION_NAMESPACE)
            .filter(|n| !n.is_empty())?;
        Some(Self::new(cluster.clone(), namespace.clone()))
    }

    /// Write the marker onto host object metadata
    pub fn stamp(&self, meta: &mut ObjectMeta) {
        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(ANNOTATION_CLUSTER.to_string(), self.cluster.clone());
        annotations.insert(ANNOTATION_NAMESPACE.to_string(), self.namespace.clone());
    }
}

/// Identity of a tenant object across all tenant clusters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey {
    /// Tenant cluster name
    pub cluster: String,
    /// Tenant namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl TenantKey {
    /// Create a key for the given tenant object coordinates
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// Identity of a host object, including the UID observed when it was indexed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Host namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// UID observed at index time, used as a delete precondition
    pub uid: Option<String>,
}

/// Explicit index from tenant owner to host projection
///
/// Built from a host listing; objects without a back-reference marker are
/// skipped since the syncer does not manage them.
#[derive(Debug, Default)]
pub struct BackReferenceIndex {
    entries: BTreeMap<TenantKey, HostKey>,
}

impl BackReferenceIndex {
    /// Index every marked object in the listing
    pub fn from_objects<'a, K, I>(objects: I) -> Self
    where
        K: kube::Resource + 'a,
        I: IntoIterator<Item = &'a K>,
    {
        let mut index = Self::default();
        for object in objects {
            index.insert(object);
        }
        index
    }

    /// Add one host object to the index, returning false if it is unmarked
    pub fn insert<K: kube::Resource>(&mut self, object: &K) -> bool {
        let Some(owner) = BackReference::from_meta(object.meta()) else {
            return false;
        };
        let Some(namespace) = object.namespace() else {
            return false;
        };
        let name = object.name_any();
        self.entries.insert(
            TenantKey::new(owner.cluster, owner.namespace, name.clone()),
            HostKey {
                namespace,
                name,
                uid: object.uid(),
            },
        );
        true
    }

    /// Look up the host projection of a tenant object
    pub fn get(&self, owner: &TenantKey) -> Option<&HostKey> {
        self.entries.get(owner)
    }

    /// Number of indexed host objects
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no objects
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate owners and their host projections in key order
    pub fn iter(&self) -> impl Iterator<Item = (&TenantKey, &HostKey)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    #[test]
    fn test_host_namespace_format() {
        assert_eq!(
            host_namespace("west", "team-a").expect("valid"),
            "4-west-team-a"
        );
    }

    #[test]
    fn test_mapping_is_injective_for_dash_ambiguity() {
        // "a-b" + "c" and "a" + "b-c" collide under naive concatenation
        let first = host_namespace("a-b", "c").expect("valid");
        let second = host_namespace("a", "b-c").expect("valid");
        assert_ne!(first, second);
    }

    #[test]
    fn test_mapping_is_injective_over_sample_space() {
        let names = ["a", "b", "a-b", "b-a", "1", "1-a", "a-1", "ab", "team-a", "x-y-z"];
        let mut seen = std::collections::HashMap::new();
        for cluster in names {
            for namespace in names {
                let mapped = host_namespace(cluster, namespace).expect("valid");
                if let Some(previous) = seen.insert(mapped.clone(), (cluster, namespace)) {
                    panic!("{mapped} produced by {previous:?} and ({cluster}, {namespace})");
                }
            }
        }
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        assert!(host_namespace("", "a").is_err());
        assert!(host_namespace("West", "a").is_err());
        assert!(host_namespace("west", "-a").is_err());
        let long = "n".repeat(60);
        let err = host_namespace("west", &long).expect_err("too long");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_back_reference_stamp_and_read() {
        let mut meta = ObjectMeta::default();
        BackReference::new("west", "team-a").stamp(&mut meta);
        assert_eq!(
            BackReference::from_meta(&meta),
            Some(BackReference::new("west", "team-a"))
        );
    }

    #[test]
    fn test_back_reference_requires_both_halves() {
        let mut meta = ObjectMeta::default();
        meta.annotations = Some(BTreeMap::from([(
            ANNOTATION_CLUSTER.to_string(),
            "west".to_string(),
        )]));
        assert_eq!(BackReference::from_meta(&meta), None);
    }

    #[test]
    fn test_index_skips_unmarked_objects() {
        let mut marked = Pod::default();
        marked.metadata.name = Some("pod1".to_string());
        marked.metadata.namespace = Some("4-west-team-a".to_string());
        marked.metadata.uid = Some("uid-1".to_string());
        BackReference::new("west", "team-a").stamp(&mut marked.metadata);

        let mut unmarked = Pod::default();
        unmarked.metadata.name = Some("native".to_string());
        unmarked.metadata.namespace = Some("default".to_string());

        let index = BackReferenceIndex::from_objects([&marked, &unmarked]);
        assert_eq!(index.len(), 1);
        let host = index
            .get(&TenantKey::new("west", "team-a", "pod1"))
            .expect("indexed");
        assert_eq!(host.namespace, "4-west-team-a");
        assert_eq!(host.uid.as_deref(), Some("uid-1"));
    }
}
