//! Writable cell implementation.
//!
//! A `Signal` is the root of the reactive graph: a container for mutable
//! state that other computations read. Reads inside an evaluating computed
//! cell or watcher register the signal as a dependency; writes request a
//! notify-check through the batch scheduler.
//!
//! # How Writes Propagate
//!
//! 1. `set` stores the value. With no subscribers, the value also becomes
//!    the broadcast baseline — nothing to notify yet, and the first
//!    subscriber must not see a stale "change".
//!
//! 2. A notify-check is requested: immediate when no batch is active,
//!    enqueued and coalesced by cell identity otherwise.
//!
//! 3. The check compares the current value against the last broadcast one
//!    under the signal's change policy, and on change invokes every
//!    subscriber with the new value.
//!
//! # Thread Safety
//!
//! State lives behind locks and handles are `Send + Sync`, but dependency
//! attribution and batching are thread-local: the graph is meant to be
//! evaluated on a single logical thread of control.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use tracing::trace;

use crate::batch;
use crate::context::{self, DepRecord};
use crate::observable::{
    default_change_fn, AnyCell, CellId, CellOptions, ChangeFn, CheckFn, SignalValue,
};
use crate::subscriber::{SubscriberCb, SubscriberId, SubscriberSet};

struct SignalState<T> {
    value: T,
    /// Value as of the last delivered notification (or adopted baseline).
    last_broadcast: T,
}

pub(crate) struct SignalInner<T>
where
    T: SignalValue,
{
    id: CellId,
    name: Option<String>,
    me: Weak<SignalInner<T>>,
    initial: T,
    has_changed: ChangeFn<T>,
    state: RwLock<SignalState<T>>,
    subs: RwLock<SubscriberSet<T>>,
}

/// A writable reactive cell holding a value of type `T`.
///
/// Cloning a `Signal` produces another handle to the same cell.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers)
/// count.set(5);
/// ```
pub struct Signal<T>
where
    T: SignalValue,
{
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: SignalValue,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self::with_options(value, CellOptions::new())
    }

    /// Create a new signal with a name and/or a custom change policy.
    pub fn with_options(value: T, options: CellOptions<T>) -> Self {
        let has_changed = options.has_changed.unwrap_or_else(default_change_fn);
        let inner = Arc::new_cyclic(|me| SignalInner {
            id: CellId::new(),
            name: options.name,
            me: me.clone(),
            initial: value.clone(),
            has_changed,
            state: RwLock::new(SignalState {
                value: value.clone(),
                last_broadcast: value,
            }),
            subs: RwLock::new(SubscriberSet::new()),
        });
        Self { inner }
    }

    /// Get the signal's cell identity.
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Diagnostic name, if one was given at construction.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Tracked read: returns the current value and, when a computed cell or
    /// watcher is evaluating, registers this signal as one of its
    /// dependencies.
    pub fn get(&self) -> T {
        let value = self.inner.read_value();
        context::record(|| self.inner.dep_record(&value));
        value
    }

    /// Untracked read: never registers a dependency.
    pub fn peek(&self) -> T {
        self.inner.read_value()
    }

    /// Store `value` and request a notify-check.
    ///
    /// Inside a batch the check is deferred and coalesced with other writes
    /// to this signal; outside it runs immediately.
    pub fn set(&self, value: T) -> T {
        trace!(cell = self.inner.id.raw(), name = ?self.inner.name, "set");
        self.inner.state.write().value = value.clone();
        if self.inner.subs.read().is_empty() {
            // Nothing to notify; the write becomes the broadcast baseline so
            // the first subscriber does not observe a stale change.
            self.inner.state.write().last_broadcast = value.clone();
        }
        let inner = self.inner.clone();
        batch::schedule(self.inner.id, Arc::new(move || inner.check()));
        value
    }

    /// Update the value using the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let next = f(&self.inner.read_value());
        self.set(next)
    }

    /// Restore the construction-time value.
    pub fn reset(&self) -> T {
        self.set(self.inner.initial.clone())
    }

    /// Register `cb` without an immediate call. Returns the id to pass to
    /// [`Signal::unsubscribe`].
    pub fn observe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        self.inner.attach(SubscriberId::new(), Arc::new(cb))
    }

    /// Register `cb` and invoke it immediately with the current value.
    pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        let cb: SubscriberCb<T> = Arc::new(cb);
        let id = self.inner.attach(SubscriberId::new(), cb.clone());
        cb(&self.inner.read_value());
        id
    }

    /// Remove the subscriber registered under `id`. Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.subs.write().remove(id);
    }

    /// Number of current subscribers, dependency edges included.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().len()
    }
}

impl<T> SignalInner<T>
where
    T: SignalValue,
{
    fn read_value(&self) -> T {
        self.state.read().value.clone()
    }

    fn attach(&self, id: SubscriberId, cb: SubscriberCb<T>) -> SubscriberId {
        let first = {
            let mut subs = self.subs.write();
            let first = subs.is_empty();
            subs.insert(id, cb);
            first
        };
        if first {
            // Baseline on the 0 -> 1 transition: the first subscriber must
            // not be notified for changes that predate it.
            let mut state = self.state.write();
            state.last_broadcast = state.value.clone();
        }
        id
    }

    /// Notify pass: compare the current value against the last broadcast
    /// one and deliver to every subscriber on change. Locks are released
    /// before user code (change policy, callbacks) runs.
    fn check(&self) {
        let (last, value) = {
            let state = self.state.read();
            (state.last_broadcast.clone(), state.value.clone())
        };
        if !(self.has_changed)(&last, &value) {
            return;
        }
        let cbs = {
            let subs = self.subs.read();
            if subs.is_empty() {
                return;
            }
            subs.snapshot()
        };
        self.state.write().last_broadcast = value.clone();
        trace!(
            cell = self.id.raw(),
            name = ?self.name,
            subscribers = cbs.len(),
            "notifying"
        );
        for cb in cbs {
            cb(&value);
        }
    }

    fn dep_record(&self, value: &T) -> DepRecord {
        let handle: Weak<dyn AnyCell> = self.me.clone();
        let me = self.me.clone();
        let recorded = value.clone();
        let has_changed = self.has_changed.clone();
        DepRecord {
            id: self.id,
            handle,
            unchanged: Arc::new(move || match me.upgrade() {
                Some(cell) => {
                    let current = cell.read_value();
                    !(has_changed)(&recorded, &current)
                }
                // A dropped dependency reads as a no-op: it cannot change.
                None => true,
            }),
        }
    }
}

impl<T> AnyCell for SignalInner<T>
where
    T: SignalValue,
{
    fn attach_check(&self, sub: SubscriberId, check: CheckFn) {
        self.attach(sub, Arc::new(move |_: &T| check()));
    }

    fn detach_check(&self, sub: SubscriberId) {
        self.subs.write().remove(sub);
    }
}

impl<T> Clone for Signal<T>
where
    T: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: SignalValue + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id.raw())
            .field("name", &self.inner.name)
            .field("value", &self.peek())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<T> Serialize for Signal<T>
where
    T: SignalValue + Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.peek().serialize(serializer)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
        assert_eq!(signal.peek(), 42);
    }

    #[test]
    fn signal_update_and_reset() {
        let signal = Signal::new(10);
        assert_eq!(signal.update(|v| v + 5), 15);
        assert_eq!(signal.get(), 15);

        assert_eq!(signal.reset(), 10);
        assert_eq!(signal.get(), 10);
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);
        assert_ne!(s1.id(), s2.id());
    }

    #[test]
    fn observe_notifies_on_change() {
        let signal = Signal::new(0);
        let seen = Arc::new(AtomicI32::new(-1));
        let calls = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        let calls_clone = calls.clone();
        signal.observe(move |v| {
            seen_clone.store(*v, Ordering::SeqCst);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        // No immediate call.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signal.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_calls_immediately() {
        let signal = Signal::new(3);
        let seen = Arc::new(AtomicI32::new(-1));

        let seen_clone = seen.clone();
        signal.subscribe(move |v| {
            seen_clone.store(*v, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unchanged_value_does_not_notify() {
        let signal = Signal::new(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        signal.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signal.set(6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let signal = Signal::new(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let sub = signal.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        signal.unsubscribe(sub);
        signal.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Idempotent.
        signal.unsubscribe(sub);
    }

    #[test]
    fn write_before_first_observer_becomes_the_baseline() {
        let signal = Signal::new(1);
        signal.set(5);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        signal.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Re-writing the already-current value is not a change.
        signal.set(5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_change_policy() {
        // Only notify when the value crosses a threshold of 2.
        let signal = Signal::with_options(
            0,
            CellOptions::new()
                .named("coarse")
                .has_changed(|old: &i32, new: &i32| (old - new).abs() >= 2),
        );
        assert_eq!(signal.name(), Some("coarse"));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        signal.observe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        signal.set(3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn serializes_the_current_value() {
        let signal = Signal::new(vec![1, 2, 3]);
        assert_eq!(serde_json::to_string(&signal).unwrap(), "[1,2,3]");
    }
}
