//! Subscriber identity and the per-cell subscriber registry.
//!
//! Every party interested in a cell's value — an external callback, a
//! computed cell's notify-check, a watcher — is registered under a
//! `SubscriberId`. Keying subscriptions by id rather than by callback
//! identity keeps removal explicit and cheap, and lets a computed cell
//! register itself on all of its dependencies under a single stable id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

/// Callback invoked with a cell's new value on notification.
pub(crate) type SubscriberCb<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Unique identifier for a subscriber.
///
/// Returned by `observe`/`subscribe` and passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// The subscriber registry of a single cell.
///
/// Insertion order is preserved so notifications run in registration order.
/// Most cells have at most a couple of subscribers; the inline capacity
/// keeps that case allocation-free.
pub(crate) struct SubscriberSet<T> {
    entries: SmallVec<[(SubscriberId, SubscriberCb<T>); 2]>,
}

impl<T> SubscriberSet<T> {
    pub fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    /// Insert or replace the callback registered under `id`.
    pub fn insert(&mut self, id: SubscriberId, cb: SubscriberCb<T>) {
        if let Some(entry) = self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = cb;
        } else {
            self.entries.push((id, cb));
        }
    }

    /// Remove the subscriber registered under `id`. Idempotent.
    pub fn remove(&mut self, id: SubscriberId) {
        self.entries.retain(|(eid, _)| *eid != id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Clone out the callbacks so they can be invoked without holding the
    /// registry lock (a subscriber may re-enter the cell).
    pub fn snapshot(&self) -> SmallVec<[SubscriberCb<T>; 2]> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
