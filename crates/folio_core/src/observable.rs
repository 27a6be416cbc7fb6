//! Subscribable values and event streams.
//!
//! [`Subject`] holds the latest snapshot of a collection and replays it to new
//! subscribers. Every emission is a freshly allocated `Arc<T>`, so consumers
//! may compare snapshots by pointer. [`EventStream`] carries values without
//! retaining them (error strings, queue events).
//!
//! Subscribing returns a [`Subscription`] guard; dropping it unsubscribes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback invoked for every emitted value.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Thread-safe registry of callbacks keyed by subscription id.
///
/// Callbacks run in subscription order. The callback list is cloned before
/// dispatch, so a callback may subscribe or unsubscribe without deadlocking.
pub struct CallbackRegistry<T> {
    callbacks: RwLock<BTreeMap<SubscriptionId, Callback<T>>>,
    next_id: AtomicU64,
}

impl<T> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback, returning its id.
    pub fn subscribe(&self, callback: Callback<T>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.write().unwrap().insert(id, callback);
        id
    }

    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks.write().unwrap().remove(&id).is_some()
    }

    /// Invoke every registered callback with `value`.
    ///
    /// A panicking callback does not prevent the others from running.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self.callbacks.read().unwrap().values().cloned().collect();
        for callback in callbacks {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(value);
            }));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.callbacks.write().unwrap().clear();
    }
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

/// Guard returned by `subscribe`. Unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn for_registry<T: 'static>(registry: &Arc<CallbackRegistry<T>>, id: SubscriptionId) -> Self {
        let weak: Weak<CallbackRegistry<T>> = Arc::downgrade(registry);
        Self::from_fn(move || {
            if let Some(registry) = weak.upgrade() {
                registry.unsubscribe(id);
            }
        })
    }

    /// Wrap an arbitrary teardown action.
    pub fn from_fn(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the lifetime of the source.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Latest-value holder with replay to new subscribers.
pub struct Subject<T> {
    value: RwLock<Arc<T>>,
    registry: Arc<CallbackRegistry<Arc<T>>>,
}

impl<T: Send + Sync + 'static> Subject<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: RwLock::new(Arc::new(initial)),
            registry: Arc::new(CallbackRegistry::new()),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.value.read().unwrap())
    }

    /// Replace the snapshot and notify subscribers.
    pub fn next(&self, value: T) {
        let value = Arc::new(value);
        *self.value.write().unwrap() = Arc::clone(&value);
        self.registry.emit(&value);
    }

    /// Subscribe; the callback is invoked immediately with the current value.
    pub fn subscribe(&self, callback: impl Fn(&Arc<T>) + Send + Sync + 'static) -> Subscription {
        let callback: Callback<Arc<T>> = Arc::new(callback);
        let id = self.registry.subscribe(Arc::clone(&callback));
        callback(&self.get());
        Subscription::for_registry(&self.registry, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }
}

impl<T: Default + Send + Sync + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("value", &self.value.read().unwrap())
            .field("subscribers", &self.registry.subscriber_count())
            .finish()
    }
}

/// Fire-and-forget stream of values.
pub struct EventStream<T> {
    registry: Arc<CallbackRegistry<T>>,
}

impl<T: Send + Sync + 'static> EventStream<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(CallbackRegistry::new()),
        }
    }

    pub fn emit(&self, value: T) {
        self.registry.emit(&value);
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.subscribe(Arc::new(callback));
        Subscription::for_registry(&self.registry, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }
}

impl<T: Send + Sync + 'static> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("subscribers", &self.registry.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_registry_subscribe_emit_unsubscribe() {
        let registry = CallbackRegistry::<u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let id = registry.subscribe(Arc::new(move |v| {
            counter_clone.fetch_add(*v as usize, Ordering::SeqCst);
        }));

        registry.emit(&2);
        registry.emit(&3);
        assert_eq!(counter.load(Ordering::SeqCst), 5);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&10);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let registry = CallbackRegistry::<()>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_| panic!("boom")));
        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subject_replays_current_value() {
        let subject = Subject::new(vec![1, 2]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let _sub = subject.subscribe(move |v| seen_clone.lock().unwrap().push(v.as_ref().clone()));
        subject.next(vec![3]);

        assert_eq!(*seen.lock().unwrap(), vec![vec![1, 2], vec![3]]);
        assert_eq!(*subject.get(), vec![3]);
    }

    #[test]
    fn test_subject_emits_fresh_allocation() {
        let subject = Subject::new(vec![1]);
        let before = subject.get();
        subject.next(vec![1]);
        let after = subject.get();
        assert_eq!(before, after);
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let subject = Subject::new(0u8);
        let sub = subject.subscribe(|_| {});
        assert_eq!(subject.subscriber_count(), 1);
        drop(sub);
        assert_eq!(subject.subscriber_count(), 0);

        let stream = EventStream::<String>::new();
        stream.subscribe(|_| {}).detach();
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[test]
    fn test_event_stream_does_not_replay() {
        let stream = EventStream::<String>::new();
        stream.emit("lost".to_string());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = stream.subscribe(move |s| seen_clone.lock().unwrap().push(s.clone()));
        stream.emit("kept".to_string());

        assert_eq!(*seen.lock().unwrap(), vec!["kept".to_string()]);
    }
}
