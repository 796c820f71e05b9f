//! Controller runtime: watches feed a keyed work queue, workers run reconciliation cycles.
//!
//! Every change event enqueues the changed object (when its kind is reconciled) and every
//! dependent the reverse index reports for it. Cycle outcomes decide when a key comes back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_api::{AccessError, AccessResult, ChangeEvent, EventType, ObjectAccessor};
use trellis_core::{Action, EngineError, EngineResult, ErrorClass, Object, ObjectKey};
use trellis_index::{IndexError, Indexer, Registry};
use trellis_store::WorkQueue;

use crate::{reconcile, Config, Context, Reconciler};

pub struct ControllerBuilder {
    accessor: Arc<dyn ObjectAccessor>,
    config: Config,
    cancel: CancellationToken,
    reconcilers: Vec<Arc<dyn Reconciler>>,
}

impl ControllerBuilder {
    pub fn new(accessor: Arc<dyn ObjectAccessor>, config: Config) -> Self {
        Self { accessor, config, cancel: CancellationToken::new(), reconcilers: Vec::new() }
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn reconciler(mut self, r: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(r);
        self
    }

    /// Register every reconciler's reference fields in the reverse index and assemble the controller.
    pub fn build(self) -> Result<Arc<Controller>, IndexError> {
        let mut builder = Registry::builder();
        let mut by_kind: FxHashMap<String, Arc<dyn Reconciler>> = FxHashMap::default();
        for r in self.reconcilers {
            let kind = r.kind().kind;
            for field in r.references() {
                builder = field.register(kind, builder)?;
            }
            by_kind.insert(kind.to_string(), r);
        }
        let registry = builder.build();
        let indexer = Indexer::new(registry, self.accessor.clone());
        let ctx = Context::new(self.accessor, self.config).with_cancel(self.cancel);
        Ok(Arc::new(Controller {
            ctx,
            reconcilers: by_kind,
            indexer,
            queue: Arc::new(WorkQueue::new()),
            delayed: Arc::new(Mutex::new(FxHashMap::default())),
            failures: Mutex::new(FxHashMap::default()),
        }))
    }
}

/// Outcome of [`Controller::drain`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct DrainReport {
    pub steps: usize,
    /// Keys that asked to come back later, with the delay they asked for.
    pub waiting: Vec<(ObjectKey, Duration)>,
    /// Keys whose cycle failed without a retry (validation).
    pub failed: Vec<(ObjectKey, String)>,
    /// The step budget ran out with work still queued.
    pub exhausted: bool,
}

pub struct Controller {
    ctx: Context,
    reconcilers: FxHashMap<String, Arc<dyn Reconciler>>,
    indexer: Indexer,
    queue: Arc<WorkQueue<ObjectKey>>,
    /// Deadline of the one pending delayed re-add per key.
    delayed: Arc<Mutex<FxHashMap<ObjectKey, Instant>>>,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl Controller {
    pub fn builder(accessor: Arc<dyn ObjectAccessor>, config: Config) -> ControllerBuilder {
        ControllerBuilder::new(accessor, config)
    }

    pub fn context(&self) -> &Context { &self.ctx }
    pub fn indexer(&self) -> &Indexer { &self.indexer }
    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    /// Keys waiting on a delayed re-add.
    pub fn pending_requeues(&self) -> usize { self.delayed.lock().unwrap_or_else(|e| e.into_inner()).len() }

    /// Reconciled kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.reconcilers.keys().map(|k| k.as_str()).collect();
        v.sort_unstable();
        v
    }

    /// Kinds that need a watch: reconciled kinds plus every reference target kind.
    pub fn watched_kinds(&self) -> Vec<String> {
        let mut v: Vec<String> = self.reconcilers.keys().cloned().collect();
        v.extend(self.indexer.registry().target_kinds().map(|k| k.to_string()));
        v.sort_unstable();
        v.dedup();
        v
    }

    pub fn enqueue(&self, key: ObjectKey) {
        if self.reconcilers.contains_key(&key.kind) && self.ctx.config.watches(key.namespace()) {
            self.queue.add(key);
        }
    }

    /// Enqueue every existing object of every reconciled kind.
    pub async fn seed(&self) -> AccessResult<usize> {
        let ns = self.ctx.config.namespace.as_deref();
        let mut n = 0;
        for kind in self.kinds() {
            for o in self.ctx.accessor.list(kind, ns, None).await? {
                self.enqueue(o.key());
                n += 1;
            }
        }
        Ok(n)
    }

    /// Route one change event into the queue.
    pub async fn handle_event(&self, ev: &ChangeEvent) {
        if ev.event_type == EventType::Applied {
            self.enqueue(ev.object.key());
        }
        match self.indexer.invalidate(&ev.object).await {
            Ok(keys) => keys.into_iter().for_each(|k| self.enqueue(k)),
            Err(e) => warn!(changed = %ev.object.key(), error = %e, "invalidate failed"),
        }
    }

    /// Run watches and workers until the cancel token fires.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let cancel = self.ctx.cancel.clone();
        let mut tasks = JoinSet::new();
        for kind in self.watched_kinds() {
            tasks.spawn(self.clone().watch_kind(kind));
        }
        for id in 0..self.ctx.config.workers {
            tasks.spawn(self.clone().worker(id));
        }
        info!(workers = self.ctx.config.workers, kinds = ?self.kinds(), "controller started");
        cancel.cancelled().await;
        self.queue.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
        Ok(())
    }

    async fn watch_kind(self: Arc<Self>, kind: String) {
        let cancel = self.ctx.cancel.clone();
        let mut attempt = 0u32;
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                s = self.ctx.accessor.watch(&kind) => s,
            };
            match opened {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        ev = stream.next() => ev,
                    };
                    match next {
                        Some(Ok(ev)) => {
                            attempt = 0;
                            self.handle_event(&ev).await;
                        }
                        Some(Err(e)) => {
                            warn!(%kind, error = %e, "watch interrupted");
                            break;
                        }
                        None => {
                            debug!(%kind, "watch stream ended");
                            break;
                        }
                    }
                },
                Err(e) => warn!(%kind, error = %e, "watch failed to start"),
            }
            let delay = self.ctx.config.backoff(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        while let Some(key) = self.queue.next().await {
            let (_, outcome) = self.process(&key).await;
            self.queue.done(&key);
            self.schedule(key, outcome);
        }
        debug!(worker = id, "worker exiting");
    }

    /// Fetch and reconcile one key. Returns the object as read and the cycle outcome.
    async fn process(&self, key: &ObjectKey) -> (Option<Object>, EngineResult<Action>) {
        let Some(r) = self.reconcilers.get(&key.kind) else {
            return (None, Ok(Action::Done));
        };
        let object = match self.ctx.accessor.get_key(key).await {
            Ok(o) => o,
            Err(AccessError::NotFound(_)) => return (None, Ok(Action::Done)),
            Err(e) => return (None, Err(e.into())),
        };
        let t0 = Instant::now();
        let outcome = tokio::select! {
            _ = self.ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            r = reconcile(&self.ctx, r.as_ref(), object.clone()) => r,
        };
        let label = match &outcome {
            Ok(Action::Done) => "done",
            Ok(_) => "requeue",
            Err(e) => match e.class() {
                ErrorClass::Conflict => "conflict",
                ErrorClass::Transient => "error",
                ErrorClass::Validation => "invalid",
                ErrorClass::Cancelled => "cancelled",
            },
        };
        counter!("reconcile_total", 1u64, "result" => label);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => key.kind.clone());
        debug!(%key, result = label, "reconciled");
        (Some(object), outcome)
    }

    /// Next delivery for a key after its cycle. `None` drops the key until the next event.
    fn next_delivery(&self, key: &ObjectKey, outcome: &EngineResult<Action>) -> Option<Duration> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(action) => {
                failures.remove(key);
                match action {
                    Action::Done => None,
                    Action::RequeueNow => Some(Duration::ZERO),
                    Action::RequeueAfter(d) => Some(*d),
                }
            }
            Err(e) => match e.class() {
                ErrorClass::Conflict => {
                    counter!("status_conflicts_total", 1u64);
                    debug!(%key, "conflict; retrying with a fresh read");
                    Some(Duration::ZERO)
                }
                ErrorClass::Transient => {
                    let n = failures.entry(key.clone()).or_insert(0);
                    let delay = self.ctx.config.backoff(*n);
                    *n = n.saturating_add(1);
                    warn!(%key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed");
                    Some(delay)
                }
                ErrorClass::Validation => {
                    failures.remove(key);
                    warn!(%key, error = %e, "invalid object; waiting for a change");
                    None
                }
                ErrorClass::Cancelled => None,
            },
        }
    }

    fn schedule(&self, key: ObjectKey, outcome: EngineResult<Action>) {
        match self.next_delivery(&key, &outcome) {
            None => {
                // Nothing left to wait for; a pending timer for this key would only repeat the cycle.
                self.delayed.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
            Some(d) if d.is_zero() => self.queue.add(key),
            Some(d) => self.add_after(key, d),
        }
    }

    /// Re-add `key` after `delay`. At most one timer is pending per key; a later deadline
    /// never replaces an earlier one.
    fn add_after(&self, key: ObjectKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut delayed = self.delayed.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = delayed.get(&key) {
                if *at <= deadline {
                    debug!(%key, "delayed requeue already pending");
                    return;
                }
            }
            delayed.insert(key.clone(), deadline);
        }
        let queue = self.queue.clone();
        let delayed = self.delayed.clone();
        let cancel = self.ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut pending = delayed.lock().unwrap_or_else(|e| e.into_inner());
                    // Superseded by an earlier deadline, or cleared by a settled cycle.
                    if pending.get(&key) != Some(&deadline) {
                        return;
                    }
                    pending.remove(&key);
                    drop(pending);
                    queue.add(key);
                }
            }
        });
    }

    /// Process queued keys on the calling task until the queue is empty or `max_steps` cycles ran.
    ///
    /// Writes made by a cycle are routed through [`Controller::handle_event`] directly, so no
    /// watch is needed. Delayed requeues are reported instead of waited for.
    pub async fn drain(&self, max_steps: usize) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(key) = self.queue.pop() {
            if report.steps >= max_steps {
                self.queue.done(&key);
                self.queue.add(key);
                report.exhausted = true;
                break;
            }
            report.steps += 1;
            let (before, outcome) = self.process(&key).await;
            self.queue.done(&key);
            self.propagate(&key, before).await;
            report.failed.retain(|(k, _)| k != &key);
            report.waiting.retain(|(k, _)| k != &key);
            if let Err(EngineError::Validation(msg)) = &outcome {
                report.failed.push((key.clone(), msg.clone()));
            }
            match self.next_delivery(&key, &outcome) {
                None => {}
                Some(d) if d.is_zero() => self.queue.add(key),
                Some(d) => report.waiting.push((key, d)),
            }
        }
        report.waiting.sort();
        report
    }

    /// Emit the change a watch would have delivered for `key` after its cycle.
    async fn propagate(&self, key: &ObjectKey, before: Option<Object>) {
        let Some(before) = before else { return };
        match self.ctx.accessor.get_key(key).await {
            Ok(after) if after.resource_version != before.resource_version => {
                self.handle_event(&ChangeEvent { event_type: EventType::Applied, object: after }).await;
            }
            Ok(_) => {}
            Err(AccessError::NotFound(_)) => {
                self.handle_event(&ChangeEvent { event_type: EventType::Deleted, object: before }).await;
            }
            Err(e) => warn!(%key, error = %e, "re-read after reconcile failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dependencies;
    use trellis_core::KindInfo;
    use trellis_store::MemoryStore;

    const PAGE: KindInfo = KindInfo::namespaced("trellis.dev", "v1alpha1", "Page");

    /// Never finishes on its own.
    struct Stalls;

    #[async_trait::async_trait]
    impl Reconciler for Stalls {
        fn kind(&self) -> KindInfo { PAGE }
        async fn apply(&self, _ctx: &Context, _object: &mut Object, _deps: &Dependencies) -> EngineResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn key(name: &str) -> ObjectKey { ObjectKey::new("Page", Some("site"), name) }

    fn transient() -> EngineResult<Action> { Err(EngineError::Transient(anyhow::anyhow!("storage unavailable"))) }

    #[tokio::test]
    async fn cancelled_cycle_writes_nothing_and_is_not_requeued() {
        let store = Arc::new(MemoryStore::new());
        let page = store.put(Object::new("Page", Some("site"), "home"));
        let c = Controller::builder(store.clone(), Config::default()).reconciler(Arc::new(Stalls)).build().unwrap();
        let cancel = c.context().cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let (_, outcome) = c.process(&page.key()).await;
        assert!(matches!(outcome, Err(EngineError::Cancelled)));
        c.schedule(page.key(), outcome);
        assert!(c.queue().is_empty());
        assert_eq!(c.pending_requeues(), 0);

        let cur = store.get_key(&page.key()).await.unwrap();
        assert_eq!(cur.resource_version, page.resource_version);
        assert!(cur.status.conditions.is_empty());
    }

    #[tokio::test]
    async fn conflicts_retry_at_once() {
        let c = Controller::builder(Arc::new(MemoryStore::new()), Config::default()).build().unwrap();
        let a = key("a");
        let conflict: EngineResult<Action> = Err(EngineError::Conflict(a.clone()));
        assert_eq!(c.next_delivery(&a, &conflict), Some(Duration::ZERO));
        c.schedule(a.clone(), conflict);
        assert_eq!(c.queue().pop(), Some(a));
        assert_eq!(c.pending_requeues(), 0);
    }

    #[tokio::test]
    async fn transient_errors_back_off_per_key_and_reset_on_success() {
        let cfg = Config { backoff_base: Duration::from_millis(100), backoff_max: Duration::from_secs(10), ..Config::default() };
        let c = Controller::builder(Arc::new(MemoryStore::new()), cfg).build().unwrap();
        let (a, b) = (key("a"), key("b"));

        assert_eq!(c.next_delivery(&a, &transient()), Some(Duration::from_millis(100)));
        assert_eq!(c.next_delivery(&a, &transient()), Some(Duration::from_millis(200)));
        assert_eq!(c.next_delivery(&a, &transient()), Some(Duration::from_millis(400)));
        assert_eq!(c.next_delivery(&b, &transient()), Some(Duration::from_millis(100)));
        let panicked: EngineResult<Action> = Err(EngineError::Panicked("boom".into()));
        assert_eq!(c.next_delivery(&b, &panicked), Some(Duration::from_millis(200)));

        assert_eq!(c.next_delivery(&a, &Ok(Action::Done)), None);
        assert_eq!(c.next_delivery(&a, &transient()), Some(Duration::from_millis(100)));
        assert_eq!(c.next_delivery(&b, &Err(EngineError::Validation("bad".into()))), None);
        assert_eq!(c.next_delivery(&b, &transient()), Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn repeated_delayed_requeues_keep_one_timer() {
        let c = Controller::builder(Arc::new(MemoryStore::new()), Config::default()).build().unwrap();
        let k = key("home");
        for _ in 0..8 {
            c.schedule(k.clone(), Ok(Action::RequeueAfter(Duration::from_millis(80))));
        }
        assert_eq!(c.pending_requeues(), 1);
        // An earlier deadline supersedes the pending one.
        c.schedule(k.clone(), Ok(Action::RequeueAfter(Duration::from_millis(20))));
        assert_eq!(c.pending_requeues(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.pending_requeues(), 0);
        assert_eq!(c.queue().pop(), Some(k.clone()));
        c.queue().done(&k);

        // The superseded timer fires without re-adding the key.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(c.queue().is_empty());
    }

    #[tokio::test]
    async fn settled_cycle_clears_a_pending_requeue() {
        let c = Controller::builder(Arc::new(MemoryStore::new()), Config::default()).build().unwrap();
        let k = key("home");
        c.schedule(k.clone(), Ok(Action::RequeueAfter(Duration::from_millis(30))));
        assert_eq!(c.pending_requeues(), 1);
        c.schedule(k.clone(), Ok(Action::Done));
        assert_eq!(c.pending_requeues(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(c.queue().is_empty());
    }
}
