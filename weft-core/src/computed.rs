//! Computed cell implementation.
//!
//! A `Computed` is a derived cell: its value is produced by a getter that
//! reads other cells. Dependencies are not declared — they are whatever the
//! getter read on its last run, collected through the tracking context.
//!
//! # How Evaluation Works
//!
//! 1. `peek` scans the memo cache, most-recently-used first. An entry
//!    matches when every dependency it recorded still peeks equal to its
//!    recorded value. A hit adopts the cached value without running the
//!    getter and moves the entry to the cache front.
//!
//! 2. On a miss, the getter runs under a collector frame. Every tracked
//!    read records the dependency and its value; the completed evaluation
//!    is pushed as a new cache entry and the cache is truncated to its
//!    configured size, evicting the least recently used entry.
//!
//! 3. Writes never recompute a computed cell eagerly. They only trigger its
//!    notify-check, which re-peeks — lazily recomputing if needed — and
//!    notifies subscribers when the answer to "did your value change?" is
//!    yes.
//!
//! # Subscription States
//!
//! With no subscribers the cell keeps no dependency edges: it is a pure
//! pull-evaluated memo. The first subscriber forces one evaluation to
//! materialize edges; the last unsubscribe tears them down again. The cache
//! survives the gap, so resubscribing without any dependency change does
//! not re-run the getter.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use smallvec::SmallVec;
use tracing::trace;

use crate::batch;
use crate::context::{self, AttachCtx, DepList, DepRecord, TrackScope};
use crate::observable::{
    default_change_fn, AnyCell, CellId, CellOptions, ChangeFn, CheckFn, SignalValue,
};
use crate::subscriber::{SubscriberCb, SubscriberId, SubscriberSet};

/// Construction options for computed cells.
pub struct ComputedOptions<T> {
    cell: CellOptions<T>,
    cache_size: usize,
}

impl<T> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self {
            cell: CellOptions::default(),
            cache_size: 1,
        }
    }
}

impl<T> ComputedOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a diagnostic name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.cell = self.cell.named(name);
        self
    }

    /// Override the change-detection policy.
    pub fn has_changed(mut self, f: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.cell = self.cell.has_changed(f);
        self
    }

    /// Number of memoized (snapshot, value) entries to retain. Defaults
    /// to 1. Zero disables memoization: every read runs the getter.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }
}

/// One memoized evaluation: the result plus the dependency snapshot it was
/// computed from.
#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    deps: DepList,
}

struct ComputedState<T> {
    /// Current value; `None` until the first evaluation.
    value: Option<T>,
    /// Value as of the last delivered notification; `None` until one
    /// occurs or a subscriber baseline is adopted.
    last_broadcast: Option<T>,
}

pub(crate) struct ComputedInner<T>
where
    T: SignalValue,
{
    id: CellId,
    /// Identity under which this cell subscribes to its dependencies.
    sub_id: SubscriberId,
    name: Option<String>,
    me: Weak<ComputedInner<T>>,
    getter: Box<dyn Fn() -> T + Send + Sync>,
    has_changed: ChangeFn<T>,
    cache_size: usize,
    state: RwLock<ComputedState<T>>,
    /// Memo cache, most-recently-used first, bounded to `cache_size`.
    cache: RwLock<SmallVec<[CacheEntry<T>; 2]>>,
    /// Dependencies currently subscribed to; populated only while this cell
    /// has at least one subscriber.
    live: RwLock<DepList>,
    /// Reentrancy guard, set for the duration of an evaluation.
    evaluating: AtomicBool,
    subs: RwLock<SubscriberSet<T>>,
}

/// A lazily evaluated, memoized derived cell.
///
/// Cloning a `Computed` produces another handle to the same cell; the
/// handle itself is the memo — retain it and reuse it.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(1);
/// let doubled = Computed::new(move || count.get() * 2);
///
/// assert_eq!(doubled.get(), 2);
/// count.set(3);
/// assert_eq!(doubled.get(), 6);
/// ```
pub struct Computed<T>
where
    T: SignalValue,
{
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: SignalValue,
{
    /// Create a new computed cell with the given getter.
    ///
    /// The getter does not run until the cell is first read or subscribed.
    pub fn new(getter: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_options(getter, ComputedOptions::new())
    }

    /// Create a new computed cell with explicit options.
    pub fn with_options(
        getter: impl Fn() -> T + Send + Sync + 'static,
        options: ComputedOptions<T>,
    ) -> Self {
        let has_changed = options.cell.has_changed.unwrap_or_else(default_change_fn);
        let inner = Arc::new_cyclic(|me| ComputedInner {
            id: CellId::new(),
            sub_id: SubscriberId::new(),
            name: options.cell.name,
            me: me.clone(),
            getter: Box::new(getter),
            has_changed,
            cache_size: options.cache_size,
            state: RwLock::new(ComputedState {
                value: None,
                last_broadcast: None,
            }),
            cache: RwLock::new(SmallVec::new()),
            live: RwLock::new(DepList::new()),
            evaluating: AtomicBool::new(false),
            subs: RwLock::new(SubscriberSet::new()),
        });
        Self { inner }
    }

    /// Get the cell's identity.
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Diagnostic name, if one was given at construction.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Untracked read with cache semantics: scans the memo cache MRU-first
    /// and only falls back to the getter on a miss.
    pub fn peek(&self) -> T {
        self.inner.peek()
    }

    /// Tracked read. Delegates to `peek`, so cache semantics apply on every
    /// read path; additionally registers this cell as a dependency of the
    /// currently evaluating computation, if any.
    pub fn get(&self) -> T {
        let value = self.inner.peek();
        context::record(|| self.inner.dep_record(&value));
        value
    }

    /// Register `cb` without an immediate call.
    ///
    /// The first subscriber forces one evaluation to materialize dependency
    /// edges.
    pub fn observe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        self.inner.attach(SubscriberId::new(), Arc::new(cb))
    }

    /// Register `cb` and invoke it immediately with the current value.
    pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        let cb: SubscriberCb<T> = Arc::new(cb);
        let id = self.inner.attach(SubscriberId::new(), cb.clone());
        let value = self
            .inner
            .state
            .read()
            .value
            .clone()
            .expect("subscribed computed cell has been evaluated");
        cb(&value);
        id
    }

    /// Remove the subscriber registered under `id`. Idempotent.
    ///
    /// When the last subscriber leaves, all dependency edges are torn down;
    /// the cache is retained.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.detach(id);
    }

    /// Number of current subscribers, dependency edges included.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().len()
    }
}

impl<T> ComputedInner<T>
where
    T: SignalValue,
{
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    fn attach(&self, id: SubscriberId, cb: SubscriberCb<T>) -> SubscriberId {
        let first = {
            let mut subs = self.subs.write();
            let first = subs.is_empty();
            subs.insert(id, cb);
            first
        };
        if first {
            // 0 -> 1: force one evaluation to materialize dependency edges
            // (a cache hit re-links edges without running the getter), then
            // adopt the result as the broadcast baseline.
            let value = self.peek();
            self.state.write().last_broadcast = Some(value);
        }
        id
    }

    fn detach(&self, id: SubscriberId) {
        let emptied = {
            let mut subs = self.subs.write();
            let had = !subs.is_empty();
            subs.remove(id);
            had && subs.is_empty()
        };
        if emptied {
            // 1 -> 0: prune all dependency edges. The cache is retained so
            // a later resubscribe can hit it without recomputation.
            trace!(cell = self.id.raw(), name = ?self.name, "pruning dependency edges");
            let live = std::mem::take(&mut *self.live.write());
            for dep in live {
                if let Some(cell) = dep.handle.upgrade() {
                    cell.detach_check(self.sub_id);
                }
            }
        }
    }

    fn peek(&self) -> T {
        let _guard = EvalGuard::enter(self);
        if let Some(value) = self.lookup_cache() {
            return value;
        }
        self.recompute()
    }

    /// MRU-first scan for an entry whose every recorded dependency still
    /// peeks equal to its recorded value.
    fn lookup_cache(&self) -> Option<T> {
        let mut index = 0;
        loop {
            // Entries are cloned out so no cache lock is held while the
            // match re-peeks dependencies (which may recompute them).
            let entry = self.cache.read().get(index).cloned()?;
            if entry.deps.iter().all(|dep| (dep.unchanged)()) {
                if index > 0 {
                    let mut cache = self.cache.write();
                    if index < cache.len() {
                        let hit = cache.remove(index);
                        cache.insert(0, hit);
                    }
                }
                // Live tracking follows whichever entry is current.
                if !self.subs.read().is_empty() {
                    self.sync_edges(&entry.deps);
                }
                self.state.write().value = Some(entry.value.clone());
                trace!(cell = self.id.raw(), name = ?self.name, slot = index, "cache hit");
                return Some(entry.value);
            }
            index += 1;
        }
    }

    /// Full evaluation: run the getter under a collector frame, memoize the
    /// result, and reconcile dependency subscriptions.
    fn recompute(&self) -> T {
        trace!(cell = self.id.raw(), name = ?self.name, "recomputing");
        let tracked = !self.subs.read().is_empty();
        let attach = tracked.then(|| AttachCtx {
            sub: self.sub_id,
            request: self.check_request(),
        });

        let scope = TrackScope::collect(attach);
        // A panicking getter unwinds through the scope guard: the collector
        // frame is popped, and neither the cache, the live set, nor the
        // stored value is touched.
        let value = (self.getter)();
        let deps = scope.finish();

        if self.cache_size > 0 {
            let mut cache = self.cache.write();
            cache.insert(
                0,
                CacheEntry {
                    value: value.clone(),
                    deps: deps.clone(),
                },
            );
            cache.truncate(self.cache_size);
        }

        if tracked {
            // Reads during the getter already attached any new edges; drop
            // the ones the new evaluation no longer touches.
            let prev = std::mem::replace(&mut *self.live.write(), deps.clone());
            for old in &prev {
                if !deps.iter().any(|d| d.id == old.id) {
                    if let Some(cell) = old.handle.upgrade() {
                        cell.detach_check(self.sub_id);
                    }
                }
            }
        }

        self.state.write().value = Some(value.clone());
        value
    }

    /// Reconcile live dependency subscriptions with `deps` after a cache
    /// hit: attach newly present dependencies, detach absent ones.
    fn sync_edges(&self, deps: &DepList) {
        let request = self.check_request();
        let prev = std::mem::replace(&mut *self.live.write(), deps.clone());
        for old in &prev {
            if !deps.iter().any(|d| d.id == old.id) {
                if let Some(cell) = old.handle.upgrade() {
                    cell.detach_check(self.sub_id);
                }
            }
        }
        for dep in deps {
            if !prev.iter().any(|d| d.id == dep.id) {
                if let Some(cell) = dep.handle.upgrade() {
                    cell.attach_check(self.sub_id, request.clone());
                }
            }
        }
    }

    /// Notify-check: "did your value change?" Re-peeking lazily recomputes
    /// when needed. Skipped entirely while nothing subscribes.
    fn check(&self) {
        if self.subs.read().is_empty() {
            return;
        }
        let value = self.peek();
        let last = self.state.read().last_broadcast.clone();
        let changed = match last {
            Some(prev) => (self.has_changed)(&prev, &value),
            None => true,
        };
        if !changed {
            return;
        }
        let cbs = {
            let subs = self.subs.read();
            if subs.is_empty() {
                return;
            }
            subs.snapshot()
        };
        self.state.write().last_broadcast = Some(value.clone());
        for cb in cbs {
            cb(&value);
        }
    }

    /// Check trigger handed to dependencies. Routes through the batch
    /// scheduler so repeated triggers coalesce to one check per batch.
    fn check_request(&self) -> CheckFn {
        let me = self.me.clone();
        let id = self.id;
        Arc::new(move || {
            if let Some(cell) = me.upgrade() {
                let target = cell.clone();
                batch::schedule(id, Arc::new(move || target.check()));
            }
        })
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
                Some(cell) => !(has_changed)(&recorded, &cell.peek()),
                None => true,
            }),
        }
    }
}

impl<T> AnyCell for ComputedInner<T>
where
    T: SignalValue,
{
    fn attach_check(&self, sub: SubscriberId, check: CheckFn) {
        self.attach(sub, Arc::new(move |_: &T| check()));
    }

    fn detach_check(&self, sub: SubscriberId) {
        self.detach(sub);
    }
}

/// Clears the reentrancy flag on scope exit, panic included.
struct EvalGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> EvalGuard<'a> {
    fn enter<T: SignalValue>(cell: &'a ComputedInner<T>) -> Self {
        if cell.evaluating.swap(true, Ordering::SeqCst) {
            panic!(
                "dependency cycle: computed cell `{}` was read during its own evaluation",
                cell.label()
            );
        }
        Self {
            flag: &cell.evaluating,
        }
    }
}

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl<T> Clone for Computed<T>
where
    T: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: SignalValue + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id.raw())
            .field("name", &self.inner.name)
            .field("evaluated", &self.inner.state.read().value.is_some())
            .field("cached_entries", &self.inner.cache.read().len())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl<T> Serialize for Computed<T>
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
