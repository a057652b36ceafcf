//! Tenant watch event source
//!
//! Watches pods and claims of every registered tenant cluster, keeps the
//! tenant reflector stores current and turns watch events into reconcile
//! requests. An object seen for the first time is an Add, a known one an
//! Update. When a relist completes, objects that disappeared while the watch
//! was down are reported as Deletes.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vcsync_common::TenantKey;

use crate::clients::TenantWatch;
use crate::queue::{EventKind, EventSink, ReconcileRequest};

/// Drives the tenant watches
pub struct TenantEventSource {
    watches: Vec<TenantWatch>,
}

impl TenantEventSource {
    /// Create a source over the watches returned by cluster registration
    pub fn new(watches: Vec<TenantWatch>) -> Self {
        Self { watches }
    }

    /// Watch until `token` is cancelled, feeding the sinks
    pub async fn run(
        self,
        pods: Arc<dyn EventSink<Pod>>,
        pvcs: Arc<dyn EventSink<PersistentVolumeClaim>>,
        token: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();
        for watch in self.watches {
            info!(cluster = %watch.cluster, "Starting tenant watches");
            tasks.spawn(watch_kind(
                watch.cluster.clone(),
                Api::<Pod>::all(watch.client.clone()),
                watch.pods,
                pods.clone(),
                token.clone(),
            ));
            tasks.spawn(watch_kind(
                watch.cluster,
                Api::<PersistentVolumeClaim>::all(watch.client),
                watch.pvcs,
                pvcs.clone(),
                token.clone(),
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Tenant watch task panicked");
            }
        }
    }
}

async fn watch_kind<K>(
    cluster: String,
    api: Api<K>,
    mut writer: Writer<K>,
    sink: Arc<dyn EventSink<K>>,
    token: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = K::kind(&());
    let reader = writer.as_reader();
    let mut classifier = Classifier::new(cluster.clone());
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    let requests = classifier.classify(&reader, &event);
                    writer.apply_watcher_event(&event);
                    for request in requests {
                        sink.enqueue(request);
                    }
                }
                Some(Err(e)) => warn!(%cluster, %kind, error = %e, "Tenant watch error, will retry"),
                None => break,
            },
        }
    }
    debug!(%cluster, %kind, "Tenant watch stopped");
}

/// Turns watch events into reconcile requests against the pre-event cache
struct Classifier<K: Resource<DynamicType = ()>> {
    cluster: String,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Classifier<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn new(cluster: String) -> Self {
        Self {
            cluster,
            relisted: None,
        }
    }

    fn request(&self, object: &K, event: EventKind) -> ReconcileRequest<K> {
        let key = TenantKey::new(
            self.cluster.as_str(),
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        ReconcileRequest::new(key, event, Arc::new(object.clone()))
    }

    /// Add for unknown objects, Update for changed ones, nothing for unchanged
    fn upsert(&self, cache: &Store<K>, object: &K) -> Option<ReconcileRequest<K>> {
        match cache.get(&ObjectRef::from_obj(object)) {
            None => Some(self.request(object, EventKind::Add)),
            Some(cached)
                if cached.meta().resource_version.is_some()
                    && cached.meta().resource_version == object.meta().resource_version =>
            {
                None
            }
            Some(_) => Some(self.request(object, EventKind::Update)),
        }
    }

    fn classify(&mut self, cache: &Store<K>, event: &watcher::Event<K>) -> Vec<ReconcileRequest<K>> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(object));
                }
                self.upsert(cache, object).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                cache
                    .state()
                    .into_iter()
                    .filter(|cached| !seen.contains(&ObjectRef::from_obj(&**cached)))
                    .map(|gone| self.request(&gone, EventKind::Delete))
                    .collect()
            }
            watcher::Event::Apply(object) => self.upsert(cache, object).into_iter().collect(),
            watcher::Event::Delete(object) => vec![self.request(object, EventKind::Delete)],
        }
    }
}
