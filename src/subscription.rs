//! Keyed subscription multiplexer.
//!
//! Many local observers share one upstream subscription per key. The
//! upstream subscribe goes out with the first observer; the upstream
//! unsubscribe only goes out after the last observer has been gone for a
//! full grace period, so quick unsubscribe/resubscribe churn costs nothing
//! on the wire.
//!
//! Upstream traffic is not sent directly: it is queued as
//! [`SubscriptionRequest`]s and drained by the owner.

use crate::scheduler::{Scheduler, TimerHandle};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Receives every value published for a key.
pub trait Observer<V>: Send {
    fn notify(&mut self, value: &V);
}

impl<V, F> Observer<V> for F
where
    F: FnMut(&V) + Send,
{
    fn notify(&mut self, value: &V) {
        self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRequest<K> {
    Subscribe(K),
    Unsubscribe(K),
}

struct Record<V> {
    last_value: Option<V>,
    observers: Vec<(u64, Box<dyn Observer<V>>)>,
    teardown: Option<TimerHandle>,
    waiters: Vec<oneshot::Sender<V>>,
}

impl<V> Record<V> {
    fn new() -> Self {
        Self {
            last_value: None,
            observers: Vec::new(),
            teardown: None,
            waiters: Vec::new(),
        }
    }
}

pub struct SubscriptionMux<K, V> {
    grace: Duration,
    next_id: u64,
    records: HashMap<K, Record<V>>,
    handles: HashMap<u64, K>,
    timers: Scheduler<K>,
    requests: VecDeque<SubscriptionRequest<K>>,
}

impl<K: Debug, V> Debug for SubscriptionMux<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMux")
            .field("grace", &self.grace)
            .field("keys", &self.records.keys().collect::<Vec<_>>())
            .field("pending_requests", &self.requests.len())
            .finish()
    }
}

impl<K, V> SubscriptionMux<K, V>
where
    K: Clone + Eq + Hash + Debug,
    V: Clone,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            next_id: 0,
            records: HashMap::new(),
            handles: HashMap::new(),
            timers: Scheduler::new(),
            requests: VecDeque::new(),
        }
    }

    /// Add an observer for `key`. A known value is delivered immediately.
    pub fn subscribe(
        &mut self,
        key: K,
        observer: impl Observer<V> + 'static,
    ) -> SubscriptionHandle {
        self.next_id += 1;
        let id = self.next_id;
        let mut observer: Box<dyn Observer<V>> = Box::new(observer);

        let pending = self.ensure_record(&key).teardown.take();
        if let Some(handle) = pending {
            self.timers.cancel(handle);
            debug!("Subscription {:?} revived during grace period", key);
        }
        if let Some(record) = self.records.get_mut(&key) {
            if let Some(value) = &record.last_value {
                observer.notify(value);
            }
            record.observers.push((id, observer));
        }
        self.handles.insert(id, key);
        SubscriptionHandle(id)
    }

    /// Remove one observer. The last one out starts the teardown timer.
    /// Returns `false` for an unknown or already-removed handle.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle, now: Instant) -> bool {
        let Some(key) = self.handles.remove(&handle.0) else {
            return false;
        };
        let Some(record) = self.records.get_mut(&key) else {
            return false;
        };
        record.observers.retain(|(id, _)| *id != handle.0);
        if record.observers.is_empty() && record.teardown.is_none() {
            record.teardown = Some(self.timers.schedule_after(now, self.grace, key));
        }
        true
    }

    /// One-shot receiver for the next value of `key` (or the current one,
    /// if known). A key with no observers is torn down after the grace
    /// period; its pending receivers then resolve with an error.
    pub fn wait_for(&mut self, key: K, now: Instant) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();
        let record = self.ensure_record(&key);
        match &record.last_value {
            Some(value) => {
                let _ = tx.send(value.clone());
            }
            None => record.waiters.push(tx),
        }
        if record.observers.is_empty() && record.teardown.is_none() {
            let handle = self.timers.schedule_after(now, self.grace, key.clone());
            if let Some(record) = self.records.get_mut(&key) {
                record.teardown = Some(handle);
            }
        }
        rx
    }

    fn ensure_record(&mut self, key: &K) -> &mut Record<V> {
        if !self.records.contains_key(key) {
            self.requests
                .push_back(SubscriptionRequest::Subscribe(key.clone()));
        }
        self.records.entry(key.clone()).or_insert_with(Record::new)
    }

    /// Store and fan out a value. Values for unknown keys are ignored.
    pub fn update(&mut self, key: &K, value: V) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            debug!("Ignoring value for unsubscribed key {:?}", key);
            return false;
        };
        for (_, observer) in record.observers.iter_mut() {
            observer.notify(&value);
        }
        for waiter in record.waiters.drain(..) {
            let _ = waiter.send(value.clone());
        }
        record.last_value = Some(value);
        true
    }

    /// Tear down keys whose grace period expired with no observers.
    pub fn tick(&mut self, now: Instant) {
        for (handle, key) in self.timers.drain_due(now) {
            let expired = self
                .records
                .get(&key)
                .is_some_and(|r| r.teardown == Some(handle) && r.observers.is_empty());
            if expired {
                self.records.remove(&key);
                debug!("Subscription {:?} torn down", key);
                self.requests.push_back(SubscriptionRequest::Unsubscribe(key));
            }
        }
    }

    /// After a reconnect: forget keys nobody observes and re-subscribe the rest.
    pub fn resubscribe_all(&mut self) {
        self.cancel_timers();
        self.requests.clear();
        let mut keys: Vec<K> = self.records.keys().cloned().collect();
        keys.sort_by_key(|k| format!("{k:?}"));
        for key in keys {
            self.requests.push_back(SubscriptionRequest::Subscribe(key));
        }
    }

    /// Cancel every pending teardown. Records that were waiting on one are
    /// dropped without an upstream unsubscribe.
    pub fn cancel_timers(&mut self) {
        self.timers.clear();
        self.records.retain(|_, r| {
            r.teardown = None;
            !r.observers.is_empty()
        });
    }

    pub fn drain_requests(&mut self) -> Vec<SubscriptionRequest<K>> {
        self.requests.drain(..).collect()
    }

    pub fn value(&self, key: &K) -> Option<&V> {
        self.records.get(key).and_then(|r| r.last_value.as_ref())
    }

    pub fn observer_count(&self, key: &K) -> usize {
        self.records.get(key).map_or(0, |r| r.observers.len())
    }

    pub fn is_subscribed(&self, key: &K) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
