//! Trellis store: in-memory versioned object store and the keyed work queue.
//!
//! `MemoryStore` implements the accessor contract the way the cluster does it: a global
//! monotonically increasing resource version, generation bumps on spec change only,
//! optimistic writes, finalizer-gated deletion and broadcast watches.

#![forbid(unsafe_code)]

mod queue;

pub use queue::WorkQueue;

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use futures::stream::{BoxStream, StreamExt};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tracing::debug;
use trellis_api::{AccessError, AccessResult, ChangeEvent, EventType, ListFilter, ObjectAccessor};
use trellis_core::{Object, ObjectKey};

pub type Objects = FxHashMap<ObjectKey, Object>;

struct Inner {
    objects: Objects,
    rv: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Read side: readers never take the write lock.
    snap: ArcSwap<Objects>,
    events: broadcast::Sender<ChangeEvent>,
    unavailable: Mutex<FxHashSet<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self { Self::with_event_capacity(1024) }

    pub fn with_event_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        Self {
            inner: Mutex::new(Inner { objects: FxHashMap::default(), rv: 0 }),
            snap: ArcSwap::from_pointee(FxHashMap::default()),
            events,
            unavailable: Mutex::new(FxHashSet::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Current read snapshot.
    pub fn snapshot(&self) -> Arc<Objects> { self.snap.load_full() }

    pub fn len(&self) -> usize { self.snap.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Open watch streams.
    pub fn watchers(&self) -> usize { self.events.receiver_count() }

    /// Make every call for `kind` fail with a transient error (fault injection).
    pub fn set_unavailable(&self, kind: &str, on: bool) {
        let mut set = self.unavailable.lock().unwrap_or_else(|e| e.into_inner());
        if on { set.insert(kind.to_string()); } else { set.remove(kind); }
    }

    fn check_available(&self, kind: &str) -> AccessResult<()> {
        let set = self.unavailable.lock().unwrap_or_else(|e| e.into_inner());
        if set.contains(kind) {
            return Err(AccessError::Transient(anyhow!("{} storage unavailable", kind)));
        }
        Ok(())
    }

    fn commit(&self, inner: &mut Inner, event: ChangeEvent) {
        self.snap.store(Arc::new(inner.objects.clone()));
        debug!(kind = %event.object.kind, name = %event.object.name, ev = ?event.event_type, rv = inner.rv, "store commit");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Create or overwrite an object without version checks, as an external author would.
    pub fn put(&self, object: Object) -> Object {
        let mut inner = self.lock();
        inner.rv += 1;
        let rv = inner.rv;
        let key = object.key();
        let mut next = object;
        match inner.objects.get(&key) {
            Some(cur) => {
                next.uid = cur.uid.clone();
                next.generation = if cur.spec != next.spec { cur.generation + 1 } else { cur.generation };
                next.status = cur.status.clone();
                next.finalizers = cur.finalizers.clone();
                next.deletion_timestamp = cur.deletion_timestamp;
            }
            None => {
                next.uid = Some(uuid::Uuid::new_v4().to_string());
                next.generation = 1;
            }
        }
        next.resource_version = Some(rv.to_string());
        inner.objects.insert(key, next.clone());
        self.commit(&mut inner, ChangeEvent { event_type: EventType::Applied, object: next.clone() });
        next
    }

    fn check_version(cur: &Object, incoming: &Object) -> AccessResult<()> {
        match &incoming.resource_version {
            Some(rv) if Some(rv) != cur.resource_version.as_ref() => Err(AccessError::Conflict(incoming.key())),
            _ => Ok(()),
        }
    }

    fn store_or_finish(&self, inner: &mut Inner, next: Object) {
        let key = next.key();
        if next.is_deleting() && next.finalizers.is_empty() {
            inner.objects.remove(&key);
            self.commit(inner, ChangeEvent { event_type: EventType::Deleted, object: next });
        } else {
            inner.objects.insert(key, next.clone());
            self.commit(inner, ChangeEvent { event_type: EventType::Applied, object: next });
        }
    }
}

#[async_trait::async_trait]
impl ObjectAccessor for MemoryStore {
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<Object> {
        self.check_available(kind)?;
        let key = ObjectKey::new(kind, namespace, name);
        self.snap.load().get(&key).cloned().ok_or(AccessError::NotFound(key))
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, filter: Option<&ListFilter>) -> AccessResult<Vec<Object>> {
        self.check_available(kind)?;
        let snap = self.snap.load();
        let mut out: Vec<Object> = snap
            .values()
            .filter(|o| o.kind == kind)
            .filter(|o| namespace.is_none() || o.namespace.as_deref() == namespace)
            .filter(|o| filter.map(|f| f.matches(o)).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create(&self, object: &Object) -> AccessResult<Object> {
        self.check_available(&object.kind)?;
        let key = object.key();
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(AccessError::Conflict(key));
        }
        inner.rv += 1;
        let mut next = object.clone();
        next.uid = Some(uuid::Uuid::new_v4().to_string());
        next.generation = 1;
        next.deletion_timestamp = None;
        next.resource_version = Some(inner.rv.to_string());
        inner.objects.insert(key, next.clone());
        self.commit(&mut inner, ChangeEvent { event_type: EventType::Applied, object: next.clone() });
        Ok(next)
    }

    async fn update(&self, object: &Object) -> AccessResult<Object> {
        self.check_available(&object.kind)?;
        let key = object.key();
        let mut inner = self.lock();
        let cur = inner.objects.get(&key).ok_or_else(|| AccessError::NotFound(key.clone()))?;
        Self::check_version(cur, object)?;
        let mut next = cur.clone();
        if next.spec != object.spec {
            next.spec = object.spec.clone();
            next.generation += 1;
        }
        next.labels = object.labels.clone();
        next.finalizers = object.finalizers.clone();
        inner.rv += 1;
        next.resource_version = Some(inner.rv.to_string());
        self.store_or_finish(&mut inner, next.clone());
        Ok(next)
    }

    async fn update_status(&self, object: &Object) -> AccessResult<Object> {
        self.check_available(&object.kind)?;
        let key = object.key();
        let mut inner = self.lock();
        let cur = inner.objects.get(&key).ok_or_else(|| AccessError::NotFound(key.clone()))?;
        Self::check_version(cur, object)?;
        let mut next = cur.clone();
        next.status = object.status.clone();
        inner.rv += 1;
        next.resource_version = Some(inner.rv.to_string());
        inner.objects.insert(key, next.clone());
        self.commit(&mut inner, ChangeEvent { event_type: EventType::Applied, object: next.clone() });
        Ok(next)
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> AccessResult<()> {
        self.check_available(kind)?;
        let key = ObjectKey::new(kind, namespace, name);
        let mut inner = self.lock();
        let cur = inner.objects.get(&key).ok_or_else(|| AccessError::NotFound(key.clone()))?;
        if cur.is_deleting() {
            return Ok(());
        }
        let mut next = cur.clone();
        next.deletion_timestamp = Some(chrono::Utc::now());
        inner.rv += 1;
        next.resource_version = Some(inner.rv.to_string());
        self.store_or_finish(&mut inner, next);
        Ok(())
    }

    async fn watch(&self, kind: &str) -> AccessResult<BoxStream<'static, AccessResult<ChangeEvent>>> {
        self.check_available(kind)?;
        // Subscribe before reading the snapshot so nothing falls in between.
        let rx = self.events.subscribe();
        let mut initial: Vec<Object> = self.snap.load().values().filter(|o| o.kind == kind).cloned().collect();
        initial.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        let replay = futures::stream::iter(
            initial.into_iter().map(|object| Ok(ChangeEvent { event_type: EventType::Applied, object })),
        );
        let live = futures::stream::unfold((rx, kind.to_string()), |(mut rx, kind)| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev.object.kind == kind => return Some((Ok(ev), (rx, kind))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let err = AccessError::Transient(anyhow!("{} watch lagged by {} events", kind, n));
                        return Some((Err(err), (rx, kind)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(replay.chain(live).boxed())
    }
}
