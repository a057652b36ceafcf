//! Keyed work queue feeding the reconcilers
//!
//! Guarantees a reconcile for one [`TenantKey`] never runs concurrently with
//! itself while different keys proceed in parallel up to a worker bound.
//! Events for a key that is queued or in flight coalesce into one request
//! carrying the newest snapshot. Failed or requeued requests come back after
//! an exponential backoff owned by the queue, unless a newer event for the
//! same key arrives first. Permanent errors are not retried.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vcsync_common::{Error, TenantKey};

/// First retry delay
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Retry delay cap
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Tenant lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    /// Kind of the request left after `next` arrives for a queued key
    ///
    /// An Add that has not run yet stays an Add when updated; anything else
    /// takes the newer kind.
    fn coalesce(self, next: EventKind) -> EventKind {
        match (self, next) {
            (EventKind::Add, EventKind::Update) => EventKind::Add,
            (_, next) => next,
        }
    }
}

/// One unit of reconcile work
#[derive(Debug)]
pub struct ReconcileRequest<K> {
    /// Tenant object identity
    pub key: TenantKey,
    /// What happened to it
    pub event: EventKind,
    /// Snapshot after the change
    pub object: Arc<K>,
}

impl<K> Clone for ReconcileRequest<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            event: self.event,
            object: self.object.clone(),
        }
    }
}

impl<K> ReconcileRequest<K> {
    /// Build a request
    pub fn new(key: TenantKey, event: EventKind, object: Arc<K>) -> Self {
        Self { key, event, object }
    }
}

/// Outcome of a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Converged for now
    Done,
    /// Run the same key again after a backoff
    Requeue,
}

/// Converges one tenant object into the host
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    /// Handle one request
    async fn reconcile(&self, request: ReconcileRequest<K>) -> Result<ReconcileAction, Error>;
}

/// Accepts reconcile requests
pub trait EventSink<K>: Send + Sync {
    /// Queue a request
    fn enqueue(&self, request: ReconcileRequest<K>);
}

/// Looks up the current tenant snapshot of a key before a retry
pub type Refresh<K> = Arc<dyn Fn(&TenantKey) -> Option<Arc<K>> + Send + Sync>;

struct QueueState<K> {
    pending: HashMap<TenantKey, ReconcileRequest<K>>,
    ready: VecDeque<TenantKey>,
    in_flight: HashSet<TenantKey>,
    failures: HashMap<TenantKey, u32>,
    /// Failed requests waiting out their backoff, with the id of their timer
    backing_off: HashMap<TenantKey, (u64, ReconcileRequest<K>)>,
    next_retry: u64,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            failures: HashMap::new(),
            backing_off: HashMap::new(),
            next_retry: 0,
        }
    }
}

impl<K> QueueState<K> {
    /// Queue a request, coalescing with whatever is pending for its key
    ///
    /// `older` marks a request that predates the pending one: its kind is
    /// folded in but the pending snapshot is kept. Returns whether the key
    /// became ready for dispatch.
    fn insert(&mut self, request: ReconcileRequest<K>, older: bool) -> bool {
        let key = request.key.clone();
        if let Some(queued) = self.pending.get_mut(&key) {
            if older {
                queued.event = request.event.coalesce(queued.event);
            } else {
                queued.event = queued.event.coalesce(request.event);
                queued.object = request.object;
            }
            return false;
        }
        self.pending.insert(key.clone(), request);
        if self.in_flight.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }
}

/// Keyed, coalescing, bounded work queue
pub struct WorkQueue<K> {
    name: &'static str,
    workers: usize,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    refresh: Option<Refresh<K>>,
}

impl<K: Send + Sync + 'static> WorkQueue<K> {
    /// Create a queue dispatching at most `workers` reconciles at once
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers: workers.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            refresh: None,
        }
    }

    /// Refresh snapshots of retried requests through `refresh`
    ///
    /// A retry whose tenant object is no longer found becomes a Delete.
    pub fn with_refresh(mut self, refresh: Refresh<K>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// Number of keys waiting for dispatch
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.pending.len())
            .unwrap_or_default()
    }

    /// Whether no key is waiting for dispatch
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, mut request: ReconcileRequest<K>) {
        let Ok(mut state) = self.state.lock() else {
            warn!(queue = self.name, "Work queue state poisoned, dropping request");
            return;
        };
        // A newer event supersedes the backed-off request but keeps its kind.
        if let Some((_, stale)) = state.backing_off.remove(&request.key) {
            request.event = stale.event.coalesce(request.event);
        }
        let ready = state.insert(request, false);
        drop(state);
        if ready {
            self.notify.notify_one();
        }
    }

    fn pop(&self) -> Option<ReconcileRequest<K>> {
        let mut state = self.state.lock().ok()?;
        while let Some(key) = state.ready.pop_front() {
            if let Some(request) = state.pending.remove(&key) {
                state.in_flight.insert(key);
                return Some(request);
            }
        }
        None
    }

    async fn next(&self) -> ReconcileRequest<K> {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.pop() {
                return request;
            }
            notified.await;
        }
    }

    /// Release a key after a reconcile
    ///
    /// A failed request folds into a newer event pending for the same key.
    /// Otherwise it backs off, and the returned delay and id arm its timer.
    fn complete(
        &self,
        key: &TenantKey,
        failed: Option<ReconcileRequest<K>>,
    ) -> Option<(Duration, u64)> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        state.in_flight.remove(key);
        let timer = match failed {
            None => {
                state.failures.remove(key);
                None
            }
            Some(request) => {
                let delay = {
                    let failures = state.failures.entry(key.clone()).or_insert(0);
                    let delay = backoff(*failures);
                    *failures = failures.saturating_add(1);
                    delay
                };
                if state.pending.contains_key(key) {
                    state.insert(request, true);
                    None
                } else {
                    state.next_retry += 1;
                    let id = state.next_retry;
                    state.backing_off.insert(key.clone(), (id, request));
                    Some((delay, id))
                }
            }
        };
        if state.pending.contains_key(key) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
        timer
    }

    /// Dispatch requests to `reconciler` until `token` is cancelled
    ///
    /// After cancellation no new request is dispatched; reconciles already in
    /// flight run to completion before this returns.
    pub async fn run(self: Arc<Self>, reconciler: Arc<dyn Reconciler<K>>, token: CancellationToken) {
        info!(queue = self.name, workers = self.workers, "Work queue started");
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let request = tokio::select! {
                _ = token.cancelled() => break,
                request = self.next() => request,
            };

            let queue = self.clone();
            let reconciler = reconciler.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                queue.process(reconciler, request, token).await;
            });
            while tasks.try_join_next().is_some() {}
        }

        debug!(queue = self.name, in_flight = tasks.len(), "Draining work queue");
        while tasks.join_next().await.is_some() {}
        info!(queue = self.name, "Work queue stopped");
    }

    async fn process(
        self: Arc<Self>,
        reconciler: Arc<dyn Reconciler<K>>,
        request: ReconcileRequest<K>,
        token: CancellationToken,
    ) {
        let key = request.key.clone();
        let attempt = request.clone();
        let outcome = reconciler.reconcile(request).await;

        let failed = match &outcome {
            Ok(ReconcileAction::Done) => None,
            Ok(ReconcileAction::Requeue) => Some(attempt),
            Err(e) if !e.is_retryable() => {
                error!(queue = self.name, %key, error = %e, "Reconcile failed permanently, dropping request");
                None
            }
            Err(e) => {
                warn!(queue = self.name, %key, error = %e, "Reconcile failed, will retry");
                Some(attempt)
            }
        };
        let Some((delay, id)) = self.complete(&key, failed) else {
            return;
        };

        debug!(queue = self.name, %key, delay_ms = delay.as_millis() as u64, "Requeueing");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.retry(&key, id),
            }
        });
    }

    /// Re-queue a backed-off request unless a newer event superseded it
    fn retry(&self, key: &TenantKey, id: u64) {
        let mut request = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !matches!(state.backing_off.get(key), Some((current, _)) if *current == id) {
                debug!(queue = self.name, %key, "Retry superseded by a newer event");
                return;
            }
            let Some((_, request)) = state.backing_off.remove(key) else {
                return;
            };
            request
        };

        if let Some(refresh) = &self.refresh {
            match refresh(key) {
                Some(object) => request.object = object,
                None if request.event != EventKind::Delete => {
                    debug!(queue = self.name, %key, "Tenant object gone before retry, deleting instead");
                    request.event = EventKind::Delete;
                }
                None => {}
            }
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let ready = state.insert(request, true);
        drop(state);
        if ready {
            self.notify.notify_one();
        }
    }
}

impl<K: Send + Sync + 'static> EventSink<K> for WorkQueue<K> {
    fn enqueue(&self, request: ReconcileRequest<K>) {
        self.push(request);
    }
}

fn backoff(failures: u32) -> Duration {
    INITIAL_BACKOFF
        .checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    type Log = Arc<Mutex<Vec<(String, EventKind, String)>>>;

    struct Recording {
        log: Log,
        active: AtomicUsize,
        max_active: AtomicUsize,
        failures_left: AtomicUsize,
        times: Mutex<Vec<Instant>>,
    }

    impl Recording {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                log: Arc::new(Mutex::new(Vec::new())),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
                times: Mutex::new(Vec::new()),
            })
        }

        fn log(&self) -> Vec<(String, EventKind, String)> {
            self.log.lock().expect("mutex should not be poisoned").clone()
        }
    }

    #[async_trait]
    impl Reconciler<String> for Recording {
        async fn reconcile(
            &self,
            request: ReconcileRequest<String>,
        ) -> Result<ReconcileAction, Error> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.times
                .lock()
                .expect("mutex should not be poisoned")
                .push(Instant::now());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.log.lock().expect("mutex should not be poisoned").push((
                request.key.name.clone(),
                request.event,
                request.object.as_ref().clone(),
            ));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(Error::internal("transient"));
            }
            Ok(ReconcileAction::Done)
        }
    }

    struct Rejecting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler<String> for Rejecting {
        async fn reconcile(
            &self,
            _request: ReconcileRequest<String>,
        ) -> Result<ReconcileAction, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("host namespace exceeds 63 characters"))
        }
    }

    fn vanished() -> Refresh<String> {
        Arc::new(|_: &TenantKey| None)
    }

    fn request(name: &str, event: EventKind, version: &str) -> ReconcileRequest<String> {
        ReconcileRequest::new(
            TenantKey::new("west", "team-a", name),
            event,
            Arc::new(version.to_string()),
        )
    }

    fn start(
        queue: &Arc<WorkQueue<String>>,
        reconciler: &Arc<Recording>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(reconciler.clone(), token.clone()));
        (token, handle)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(16));
        assert_eq!(backoff(9), MAX_BACKOFF);
        assert_eq!(backoff(64), MAX_BACKOFF);
    }

    #[test]
    fn test_pending_events_coalesce() {
        let queue = WorkQueue::<String>::new("test", 1);
        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        queue.enqueue(request("pod1", EventKind::Update, "v2"));
        assert_eq!(queue.len(), 1);

        let popped = queue.pop().expect("queued");
        assert_eq!(popped.event, EventKind::Add);
        assert_eq!(popped.object.as_str(), "v2");

        queue.enqueue(request("pod2", EventKind::Update, "v1"));
        queue.enqueue(request("pod2", EventKind::Delete, "v2"));
        assert_eq!(queue.pop().expect("queued").event, EventKind::Delete);
    }

    /// Story: events arriving while a key is in flight wait for it and coalesce
    #[tokio::test(start_paused = true)]
    async fn story_busy_key_is_serialized_and_coalesced() {
        let queue = Arc::new(WorkQueue::new("test", 4));
        let reconciler = Recording::new(0);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        queue.enqueue(request("pod1", EventKind::Update, "v2"));
        queue.enqueue(request("pod1", EventKind::Update, "v3"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(
            reconciler.log(),
            vec![
                ("pod1".to_string(), EventKind::Add, "v1".to_string()),
                ("pod1".to_string(), EventKind::Update, "v3".to_string()),
            ]
        );
        assert_eq!(reconciler.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_in_parallel_up_to_bound() {
        let queue = Arc::new(WorkQueue::new("test", 2));
        let reconciler = Recording::new(0);
        let (token, handle) = start(&queue, &reconciler);

        for i in 0..5 {
            queue.enqueue(request(&format!("pod{i}"), EventKind::Add, "v1"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(reconciler.log().len(), 5);
        assert_eq!(reconciler.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_with_backoff_and_refresh() {
        let refresh: Refresh<String> = Arc::new(|_: &TenantKey| Some(Arc::new("fresh".to_string())));
        let queue = Arc::new(WorkQueue::new("test", 1).with_refresh(refresh));
        let reconciler = Recording::new(2);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        let log = reconciler.log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].2, "v1");
        assert_eq!(log[2].2, "fresh");

        let times = reconciler.times.lock().expect("mutex should not be poisoned").clone();
        assert!(times[1] - times[0] >= Duration::from_secs(1));
        assert!(times[2] - times[1] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_in_flight_work() {
        let queue = Arc::new(WorkQueue::new("test", 1));
        let reconciler = Recording::new(0);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(reconciler.log().len(), 1);

        queue.enqueue(request("pod2", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reconciler.log().len(), 1);
    }

    /// Story: a Delete that arrives while a failing Add is in flight wins
    #[tokio::test(start_paused = true)]
    async fn story_failed_add_folds_into_pending_delete() {
        let queue = Arc::new(WorkQueue::new("test", 1).with_refresh(vanished()));
        let reconciler = Recording::new(1);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        queue.enqueue(request("pod1", EventKind::Delete, "v2"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(
            reconciler.log(),
            vec![
                ("pod1".to_string(), EventKind::Add, "v1".to_string()),
                ("pod1".to_string(), EventKind::Delete, "v2".to_string()),
            ]
        );
    }

    /// Story: a Delete during the backoff of a failed Add cancels the retry
    #[tokio::test(start_paused = true)]
    async fn story_delete_during_backoff_supersedes_retry() {
        let queue = Arc::new(WorkQueue::new("test", 1));
        let reconciler = Recording::new(1);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.enqueue(request("pod1", EventKind::Delete, "v2"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(
            reconciler.log(),
            vec![
                ("pod1".to_string(), EventKind::Add, "v1".to_string()),
                ("pod1".to_string(), EventKind::Delete, "v2".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_during_backoff_keeps_add() {
        let queue = Arc::new(WorkQueue::new("test", 1));
        let reconciler = Recording::new(1);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        queue.enqueue(request("pod1", EventKind::Update, "v2"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(
            reconciler.log(),
            vec![
                ("pod1".to_string(), EventKind::Add, "v1".to_string()),
                ("pod1".to_string(), EventKind::Add, "v2".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_of_vanished_object_becomes_delete() {
        let queue = Arc::new(WorkQueue::new("test", 1).with_refresh(vanished()));
        let reconciler = Recording::new(1);
        let (token, handle) = start(&queue, &reconciler);

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(
            reconciler.log(),
            vec![
                ("pod1".to_string(), EventKind::Add, "v1".to_string()),
                ("pod1".to_string(), EventKind::Delete, "v1".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 1));
        let reconciler = Arc::new(Rejecting {
            calls: AtomicUsize::new(0),
        });
        let token = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(reconciler.clone(), token.clone()));

        queue.enqueue(request("pod1", EventKind::Add, "v1"));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        token.cancel();
        handle.await.expect("queue should stop");

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }
}
