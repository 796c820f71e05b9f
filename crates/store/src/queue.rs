//! Keyed coalescing work queue with FIFO order.
//!
//! A key is handed to at most one worker at a time. Re-adding a key that is in flight marks
//! it dirty; it is queued again when the worker calls [`WorkQueue::done`]. Keys are never
//! dropped: coalescing bounds the queue by the number of distinct keys.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use metrics::gauge;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    dirty: FxHashSet<K>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                queued: FxHashSet::default(),
                in_flight: FxHashSet::default(),
                dirty: FxHashSet::default(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn in_flight(&self) -> usize { self.lock().in_flight.len() }

    /// Nothing queued and nothing being processed.
    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.order.is_empty() && st.in_flight.is_empty()
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutdown || st.queued.contains(&key) {
            return;
        }
        if st.in_flight.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        Self::push(&mut st, key);
        drop(st);
        self.notify.notify_one();
    }

    fn push(st: &mut State<K>, key: K) {
        st.queued.insert(key.clone());
        st.order.push_back(key);
        gauge!("workqueue_depth", st.order.len() as f64);
    }

    fn try_pop(&self) -> Option<Option<K>> {
        let mut st = self.lock();
        if st.shutdown {
            return Some(None);
        }
        let key = st.order.pop_front()?;
        st.queued.remove(&key);
        gauge!("workqueue_depth", st.order.len() as f64);
        st.in_flight.insert(key.clone());
        let more = !st.order.is_empty();
        drop(st);
        // Hand the wakeup on so idle workers drain the rest.
        if more { self.notify.notify_one(); }
        Some(Some(key))
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            if let Some(res) = self.try_pop() {
                return res;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`WorkQueue::next`].
    pub fn pop(&self) -> Option<K> { self.try_pop().flatten() }

    /// Mark a key as processed, re-queueing it when it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.in_flight.remove(key);
        if st.dirty.remove(key) && !st.shutdown {
            Self::push(&mut st, key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
        // A permit for a worker that has not started waiting yet.
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shutdown }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_duplicates_in_fifo_order() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn in_flight_key_is_not_handed_out_twice() {
        let q = WorkQueue::new();
        q.add("a");
        assert_eq!(q.pop(), Some("a"));
        q.add("a");
        assert_eq!(q.pop(), None, "dirty key must wait for done");
        q.done(&"a");
        assert_eq!(q.pop(), Some("a"));
        q.done(&"a");
        assert!(q.is_idle());
    }

    #[test]
    fn backlog_keeps_every_distinct_key() {
        let q = WorkQueue::new();
        for i in 0..5000 {
            q.add(i);
        }
        q.add(0);
        assert_eq!(q.len(), 5000);
        assert_eq!(q.pop(), Some(0));
        assert_eq!((1..5000).filter_map(|_| q.pop()).count(), 4999);
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 5000);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = std::sync::Arc::new(WorkQueue::<u8>::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.next().await });
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
