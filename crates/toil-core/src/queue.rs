//! Queue controller: the facade over the store, lock manager and dispatcher.
//!
//! A `Queue` is one process's view of a named queue. Several instances with
//! the same name (in the same process or across processes) coordinate purely
//! through the shared backend; the instance id only distinguishes them in
//! locks and diagnostics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, JobHandler};
use crate::domain::events::EventKind;
use crate::domain::{
    InstanceId, Job, JobEvent, JobId, JobOutcome, JobSource, JobState, QueueStatus,
};
use crate::error::ToilError;
use crate::keys::KeySpace;
use crate::lock::LockManager;
use crate::ports::{
    Backend, Clock, InstanceIdGenerator, JsonCodec, PayloadCodec, SystemClock, UlidGenerator,
};
use crate::store::StateStore;

/// Asynchronous error report from the dispatcher: backend I/O or decode
/// failures that have no call site to return to. Emitted once per incident;
/// reconnection is the backend client's business.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Set when the error is tied to one job.
    pub job: Option<JobId>,
    pub message: String,
}

/// Local handle for a job this instance enqueued. The terminal outcome
/// arrives asynchronously when the corresponding `job:complete` or
/// `job:fail` event is observed, which requires this instance to be
/// processing (subscribed); a producer-only instance's handles resolve as
/// evicted once their registry slot lapses.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the terminal outcome. `HandleEvicted` means the registry
    /// dropped this entry (capacity, TTL, or no subscription to resolve it)
    /// and says nothing about the job itself.
    pub async fn wait(self) -> Result<JobOutcome, ToilError> {
        self.rx.await.map_err(|_| ToilError::HandleEvicted)
    }
}

struct RegistryEntry {
    tx: oneshot::Sender<JobOutcome>,
    registered_at: Instant,
}

/// Maps enqueued job ids to the local handles waiting on them.
///
/// Bounded: terminal events are not guaranteed to ever arrive (no worker, or
/// a worker that died mid-job), so entries are evicted by capacity and by
/// age instead of accumulating forever. Evicting drops the sender, which
/// resolves the handle with `HandleEvicted`.
pub(crate) struct HandleRegistry {
    entries: Mutex<HashMap<JobId, RegistryEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl HandleRegistry {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        }
    }

    pub(crate) async fn register(&self, id: JobId) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            // Drop the oldest entry to make room.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.registered_at)
                .map(|(id, _)| *id)
            {
                entries.remove(&oldest);
                warn!(job = %oldest, "handle registry full, evicting oldest entry");
            }
        }
        entries.insert(
            id,
            RegistryEntry {
                tx,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolve and release the entry for `id`; no-op when this process never
    /// tracked it (it did not originate the job, or the entry lapsed).
    pub(crate) async fn resolve(&self, id: JobId, outcome: JobOutcome) {
        let entry = self.entries.lock().await.remove(&id);
        if let Some(entry) = entry {
            // A dropped receiver just means nobody kept the handle around.
            let _ = entry.tx.send(outcome);
        }
    }

    /// Drop entries older than the TTL.
    pub(crate) async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.registered_at.elapsed() < self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "swept expired job handles");
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Shared internals, split out so the dispatcher task can hold them without
/// holding the `Queue` itself.
pub(crate) struct Inner {
    pub(crate) keys: KeySpace,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) codec: Arc<dyn PayloadCodec>,
    pub(crate) store: StateStore,
    pub(crate) lock: LockManager,
    pub(crate) registry: HandleRegistry,
    error_tx: broadcast::Sender<ErrorReport>,
}

impl Inner {
    pub(crate) fn report(&self, job: Option<JobId>, message: impl Into<String>) {
        let report = ErrorReport {
            job,
            message: message.into(),
        };
        warn!(job = ?report.job, message = %report.message, queue = %self.keys.name(), "queue error");
        // No receivers is fine; reports are observability, not control flow.
        let _ = self.error_tx.send(report);
    }

    pub(crate) async fn publish_event(&self, event: &JobEvent) -> Result<(), ToilError> {
        self.backend
            .publish(&self.keys.channel(event.kind()), &event.encode())
            .await?;
        Ok(())
    }
}

/// Builder for a `Queue`. Validation is fail-fast: `build` checks the
/// configuration before any backend call is attempted.
pub struct QueueBuilder {
    name: String,
    backend: Arc<dyn Backend>,
    prefix: String,
    codec: Arc<dyn PayloadCodec>,
    clock: Arc<dyn Clock>,
    lock_ttl: Option<Duration>,
    handle_capacity: usize,
    handle_ttl: Duration,
}

impl QueueBuilder {
    fn new(name: String, backend: Arc<dyn Backend>) -> Self {
        Self {
            name,
            backend,
            prefix: "queue:".to_string(),
            codec: Arc::new(JsonCodec),
            clock: Arc::new(SystemClock),
            lock_ttl: None,
            handle_capacity: 8192,
            handle_ttl: Duration::from_secs(600),
        }
    }

    /// Namespacing root, default `"queue:"`. Must not contain unintended
    /// separator collisions with queue names.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Expiry for execution lock markers. Without one, a lock abandoned by a
    /// crashed process stays held indefinitely.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Bound of the local handle registry.
    pub fn handle_capacity(mut self, capacity: usize) -> Self {
        self.handle_capacity = capacity;
        self
    }

    /// Age after which unresolved handles are evicted.
    pub fn handle_ttl(mut self, ttl: Duration) -> Self {
        self.handle_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<Queue, ToilError> {
        let instance = UlidGenerator::new(Arc::clone(&self.clock)).generate();
        let keys = KeySpace::new(self.prefix, self.name, instance)?;
        let store = StateStore::new(Arc::clone(&self.backend), keys.clone());
        let lock = LockManager::new(Arc::clone(&self.backend), keys.clone(), self.lock_ttl);
        let (error_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Queue {
            inner: Arc::new(Inner {
                keys,
                backend: self.backend,
                codec: self.codec,
                store,
                lock,
                registry: HandleRegistry::new(self.handle_capacity, self.handle_ttl),
                error_tx,
            }),
            clock: self.clock,
            shutdown_tx,
            shutdown_rx,
            dispatcher: Mutex::new(None),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// One process's instance of a named queue.
impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.keys.name())
            .field("instance", &self.inner.keys.instance())
            .finish_non_exhaustive()
    }
}

pub struct Queue {
    inner: Arc<Inner>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    processing: AtomicBool,
    closed: AtomicBool,
}

impl Queue {
    pub fn builder(name: impl Into<String>, backend: Arc<dyn Backend>) -> QueueBuilder {
        QueueBuilder::new(name.into(), backend)
    }

    pub fn name(&self) -> &str {
        self.inner.keys.name()
    }

    pub fn instance(&self) -> InstanceId {
        self.inner.keys.instance()
    }

    pub fn keys(&self) -> &KeySpace {
        &self.inner.keys
    }

    /// Subscribe to asynchronous error reports from this instance.
    pub fn errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.inner.error_tx.subscribe()
    }

    fn ensure_open(&self) -> Result<(), ToilError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToilError::Closed);
        }
        Ok(())
    }

    /// Enqueue a job.
    ///
    /// Persists the record, atomically places the id into `pending` (or
    /// `paused`, decided by the live status flag inside the same backend
    /// step), and announces it on `job:create`. The returned handle resolves
    /// when a terminal event for the id is observed by this instance.
    pub async fn add(&self, payload: Value) -> Result<JobHandle, ToilError> {
        self.ensure_open()?;

        let id = JobId::new(self.inner.backend.incr(&self.inner.keys.counter_key()).await?);
        let job = Job::new(
            id,
            payload,
            JobSource::new(self.name(), self.instance()),
            self.clock.now(),
        );
        job.save(
            self.inner.backend.as_ref(),
            &self.inner.keys,
            self.inner.codec.as_ref(),
        )
        .await?;

        let rx = self.inner.registry.register(id).await;
        let state = self.inner.store.place_new(id).await?;
        self.inner
            .publish_event(&JobEvent::Created { id })
            .await?;

        debug!(job = %id, queue = %self.name(), state = state.as_str(), "job enqueued");
        Ok(JobHandle { id, rx })
    }

    /// Register the processing handler and start the dispatcher.
    ///
    /// At most one handler per instance; a second registration is a
    /// configuration error, not a runtime condition. Subscribes to the three
    /// lifecycle channels on a dedicated connection, then re-announces every
    /// id already sitting in `pending` so jobs enqueued before any worker
    /// existed are picked up.
    pub async fn process(&self, handler: Arc<dyn JobHandler>) -> Result<(), ToilError> {
        self.ensure_open()?;
        if self.processing.swap(true, Ordering::SeqCst) {
            return Err(ToilError::HandlerAlreadyRegistered);
        }

        let channels: Vec<String> = EventKind::ALL
            .iter()
            .map(|kind| self.inner.keys.channel(*kind))
            .collect();
        let subscription = match self.inner.backend.subscribe(&channels).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.processing.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        let dispatcher = Dispatcher::new(Arc::clone(&self.inner), handler);
        let task = tokio::spawn(dispatcher.run(subscription, self.shutdown_rx.clone()));
        *self.dispatcher.lock().await = Some(task);

        // Stale-pending rescan, after the subscription is live so our own
        // announcements reach our own dispatcher too.
        let stale = self.inner.store.pending_ids().await?;
        let rescanned = stale.len();
        for id in stale {
            self.inner.publish_event(&JobEvent::Created { id }).await?;
        }

        info!(queue = %self.name(), instance = %self.instance(), rescanned, "processing started");
        Ok(())
    }

    /// Fetch and decode a persisted job by id.
    pub async fn load(&self, id: JobId) -> Result<Job, ToilError> {
        self.ensure_open()?;
        Job::load(
            id,
            self.inner.backend.as_ref(),
            &self.inner.keys,
            self.inner.codec.as_ref(),
        )
        .await
    }

    /// Jobs currently waiting or running: `pending` + `active`.
    pub async fn count(&self) -> Result<u64, ToilError> {
        self.count_in(&[JobState::Pending, JobState::Active]).await
    }

    /// Summed size of the given status collections.
    pub async fn count_in(&self, states: &[JobState]) -> Result<u64, ToilError> {
        self.ensure_open()?;
        self.inner.store.count(states).await
    }

    /// Drop every pending job id and its record. Best-effort against a
    /// concurrent `add`: jobs placed after the atomic batch survive.
    pub async fn empty(&self) -> Result<u64, ToilError> {
        self.ensure_open()?;
        let drained = self.inner.store.drain_pending().await?;
        info!(queue = %self.name(), drained, "emptied pending jobs");
        Ok(drained)
    }

    /// Park the queue: set the status flag, then bulk-move `pending` into
    /// `paused`. Idempotent: pausing a paused queue changes nothing.
    pub async fn pause(&self) -> Result<(), ToilError> {
        self.ensure_open()?;
        if self.inner.store.status().await? == QueueStatus::Paused {
            return Ok(());
        }
        self.inner.store.set_status(QueueStatus::Paused).await?;
        let parked = self.inner.store.pause_all().await?;
        info!(queue = %self.name(), parked = parked.len(), "queue paused");
        Ok(())
    }

    /// Reopen the queue: reset the flag, bulk-move `paused` back into
    /// `pending`, and re-announce each moved id so running workers pick them
    /// up without a restart. Idempotent.
    pub async fn resume(&self) -> Result<(), ToilError> {
        self.ensure_open()?;
        if self.inner.store.status().await? == QueueStatus::Active {
            return Ok(());
        }
        self.inner.store.set_status(QueueStatus::Active).await?;
        let released = self.inner.store.resume_all().await?;
        for id in &released {
            self.inner
                .publish_event(&JobEvent::Created { id: *id })
                .await?;
        }
        info!(queue = %self.name(), released = released.len(), "queue resumed");
        Ok(())
    }

    /// Read the persisted status flag (never cached).
    pub async fn status(&self) -> Result<QueueStatus, ToilError> {
        self.ensure_open()?;
        self.inner.store.status().await
    }

    /// Stop the dispatcher and drop this instance's subscriptions. Safe to
    /// call repeatedly, and when processing never started.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Receiver side may be long gone; that's still a clean close.
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.dispatcher.lock().await.take() {
            let _ = task.await;
        }
        info!(queue = %self.name(), instance = %self.instance(), "queue closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::backend::InMemoryBackend;

    use super::*;

    /// Counts invocations; fails every job when `fail` is set.
    struct Counting {
        hits: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Counting {
        fn ok(hits: &Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
            Arc::new(Self {
                hits: Arc::clone(hits),
                fail: false,
            })
        }

        fn failing(hits: &Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
            Arc::new(Self {
                hits: Arc::clone(hits),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(format!("rejected job {}", job.id).into());
            }
            Ok(())
        }
    }

    fn queue(backend: &InMemoryBackend, name: &str) -> Queue {
        Queue::builder(name, Arc::new(backend.clone()))
            .build()
            .unwrap()
    }

    async fn wait_for_count(q: &Queue, state: JobState, expected: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while q.count_in(&[state]).await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("count not reached in time");
    }

    #[test]
    fn empty_name_fails_before_any_backend_call() {
        let backend = InMemoryBackend::new();
        let err = Queue::builder("", Arc::new(backend)).build().unwrap_err();
        assert!(matches!(err, ToilError::EmptyName));
    }

    #[tokio::test]
    async fn add_then_load_round_trips_the_payload() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");

        let payload = json!({"to": "a@b.c", "tags": ["x", {"deep": true}]});
        let handle = q.add(payload.clone()).await.unwrap();

        let job = q.load(handle.id()).await.unwrap();
        assert_eq!(job.payload, payload);
        assert_eq!(job.source.queue, "mail");
        assert_eq!(job.source.instance, q.instance());
    }

    #[tokio::test]
    async fn counts_track_adds() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        for n in 0..3 {
            q.add(json!({ "n": n })).await.unwrap();
        }
        assert_eq!(q.count().await.unwrap(), 3);
        assert_eq!(q.count_in(&[JobState::Pending]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn pause_resume_scenario() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");

        for name in ["a", "b", "c"] {
            q.add(json!({ "name": name })).await.unwrap();
        }
        assert_eq!(q.count().await.unwrap(), 3);

        q.pause().await.unwrap();
        assert_eq!(q.status().await.unwrap(), QueueStatus::Paused);
        assert_eq!(q.count_in(&[JobState::Pending]).await.unwrap(), 0);
        assert_eq!(q.count_in(&[JobState::Paused]).await.unwrap(), 3);

        // Added while paused: lands directly in `paused`.
        q.add(json!({"name": "d"})).await.unwrap();
        assert_eq!(q.count_in(&[JobState::Paused]).await.unwrap(), 4);
        assert_eq!(q.count_in(&[JobState::Pending]).await.unwrap(), 0);

        q.resume().await.unwrap();
        assert_eq!(q.status().await.unwrap(), QueueStatus::Active);
        assert_eq!(q.count_in(&[JobState::Pending]).await.unwrap(), 4);
        assert_eq!(q.count_in(&[JobState::Paused]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pausing_twice_is_a_no_op() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        q.add(json!({})).await.unwrap();

        q.pause().await.unwrap();
        q.pause().await.unwrap();

        assert_eq!(q.status().await.unwrap(), QueueStatus::Paused);
        assert_eq!(q.count_in(&[JobState::Paused]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_drops_pending_jobs_and_records() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let first = q.add(json!({"n": 1})).await.unwrap();
        q.add(json!({"n": 2})).await.unwrap();

        assert_eq!(q.empty().await.unwrap(), 2);
        assert_eq!(q.count().await.unwrap(), 0);
        assert!(matches!(
            q.load(first.id()).await.unwrap_err(),
            ToilError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn second_handler_registration_is_rejected() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));

        q.process(Counting::ok(&hits)).await.unwrap();
        let err = q.process(Counting::ok(&hits)).await.unwrap_err();
        assert!(matches!(err, ToilError::HandlerAlreadyRegistered));
        q.close().await;
    }

    #[tokio::test]
    async fn added_job_is_executed_and_the_handle_resolves() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));
        q.process(Counting::ok(&hits)).await.unwrap();

        let handle = q.add(json!({"n": 1})).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(q.count_in(&[JobState::Complete]).await.unwrap(), 1);
        assert_eq!(q.count().await.unwrap(), 0);
        q.close().await;
    }

    #[tokio::test]
    async fn failing_handler_lands_the_job_in_failed() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));
        q.process(Counting::failing(&hits)).await.unwrap();

        let handle = q.add(json!({"n": 1})).await.unwrap();
        let id = handle.id();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();

        match outcome {
            JobOutcome::Failed { error } => assert!(error.contains(&id.to_string())),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(q.count_in(&[JobState::Failed]).await.unwrap(), 1);
        assert_eq!(q.count_in(&[JobState::Complete]).await.unwrap(), 0);
        q.close().await;
    }

    #[tokio::test]
    async fn stale_pending_jobs_are_picked_up_by_a_late_worker() {
        let backend = InMemoryBackend::new();
        let producer = queue(&backend, "mail");
        for n in 0..2 {
            producer.add(json!({ "n": n })).await.unwrap();
        }

        // Worker arrives after the jobs were enqueued.
        let worker = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));
        worker.process(Counting::ok(&hits)).await.unwrap();

        wait_for_count(&worker, JobState::Complete, 2).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        worker.close().await;
        producer.close().await;
    }

    #[tokio::test]
    async fn each_job_executes_exactly_once_across_instances() {
        let backend = InMemoryBackend::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = queue(&backend, "mail");
        let second = queue(&backend, "mail");
        first.process(Counting::ok(&hits)).await.unwrap();
        second.process(Counting::ok(&hits)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..10 {
            handles.push(first.add(json!({ "n": n })).await.unwrap());
        }
        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, JobOutcome::Completed);
        }

        // Both workers raced every announcement; the claims kept it to one
        // execution per job.
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(first.count_in(&[JobState::Complete]).await.unwrap(), 10);
        assert_eq!(first.count().await.unwrap(), 0);
        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn duplicate_create_events_do_not_rerun_the_job() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));
        q.process(Counting::ok(&hits)).await.unwrap();

        let handle = q.add(json!({})).await.unwrap();
        let id = handle.id();
        handle.wait().await.unwrap();

        // Replay the announcement; the claim has already been spent.
        backend
            .publish(&q.keys().channel(EventKind::Created), &format!("{{\"id\":{id}}}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(q.count_in(&[JobState::Complete]).await.unwrap(), 1);
        q.close().await;
    }

    #[tokio::test]
    async fn malformed_events_are_reported_and_dropped() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        let hits = Arc::new(AtomicUsize::new(0));
        let mut errors = q.errors();
        q.process(Counting::ok(&hits)).await.unwrap();

        backend
            .publish(&q.keys().channel(EventKind::Created), "not json at all")
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(report.message.contains("malformed event"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        q.close().await;
    }

    #[tokio::test]
    async fn closed_queue_rejects_calls_and_closes_idempotently() {
        let backend = InMemoryBackend::new();
        let q = queue(&backend, "mail");
        q.close().await;
        q.close().await;

        assert!(matches!(q.add(json!({})).await.unwrap_err(), ToilError::Closed));
        assert!(matches!(q.count().await.unwrap_err(), ToilError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_capacity_evicts_the_oldest_handle() {
        let registry = HandleRegistry::new(2, Duration::from_secs(600));
        let first = registry.register(JobId::new(1)).await;
        tokio::time::advance(Duration::from_millis(1)).await;
        let _second = registry.register(JobId::new(2)).await;
        tokio::time::advance(Duration::from_millis(1)).await;
        let _third = registry.register(JobId::new(3)).await;

        assert_eq!(registry.len().await, 2);
        assert!(first.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_sweep_evicts_by_age() {
        let registry = HandleRegistry::new(16, Duration::from_secs(60));
        let old = registry.register(JobId::new(1)).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = registry.register(JobId::new(2)).await;
        registry.sweep().await;

        assert_eq!(registry.len().await, 1);
        assert!(old.await.is_err());

        registry.resolve(JobId::new(2), JobOutcome::Completed).await;
        assert_eq!(fresh.await.unwrap(), JobOutcome::Completed);
    }

    #[tokio::test]
    async fn resolving_an_untracked_id_is_a_no_op() {
        let registry = HandleRegistry::new(16, Duration::from_secs(60));
        registry.resolve(JobId::new(9), JobOutcome::Completed).await;
    }
}
