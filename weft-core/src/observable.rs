//! Shared observable-cell machinery.
//!
//! Both cell flavors — writable signals and computed cells — are built from
//! the same parts: a stable identity, a change-detection policy, a
//! subscriber registry, and a type-erased edge contract that lets a
//! dependent subscribe its notify-check to a dependency without knowing the
//! dependency's value type.
//!
//! # Change Detection
//!
//! A cell only notifies subscribers when its value has changed since the
//! last broadcast, as judged by its `has_changed` policy. The default policy
//! is `PartialEq` inequality; callers can supply their own (for example a
//! NaN-tolerant float comparison, or a structural check on a subset of
//! fields) through [`CellOptions::has_changed`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::subscriber::SubscriberId;

/// Bounds required of values held in cells.
///
/// Blanket-implemented; `Clone` because reads hand out owned values,
/// `PartialEq` for the default change policy, `Send + Sync` because cell
/// handles are shareable.
pub trait SignalValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> SignalValue for T {}

/// Change-detection policy: returns `true` when `new` should be broadcast
/// given that `old` was the last broadcast value.
pub(crate) type ChangeFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Deferred notify-check, scheduled when a cell may need to notify.
pub(crate) type CheckFn = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn default_change_fn<T: PartialEq + Send + Sync + 'static>() -> ChangeFn<T> {
    Arc::new(|old, new| old != new)
}

/// Unique identity of a cell.
///
/// Keys dependency snapshots and the batch scheduler's pending-check queue,
/// which is how repeated triggers for one cell coalesce into a single check
/// per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    /// Generate a new unique cell ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value, for diagnostics.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Construction options shared by all cells.
pub struct CellOptions<T> {
    pub(crate) name: Option<String>,
    pub(crate) has_changed: Option<ChangeFn<T>>,
}

impl<T> Default for CellOptions<T> {
    fn default() -> Self {
        Self {
            name: None,
            has_changed: None,
        }
    }
}

impl<T> CellOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a diagnostic name, surfaced in traces and `Debug` output.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the change-detection policy.
    pub fn has_changed(mut self, f: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.has_changed = Some(Arc::new(f));
        self
    }
}

/// Type-erased view of a cell as a dependency target.
///
/// Computed cells and watchers attach their notify-check through this trait
/// so that dependency edges do not care about the dependency's value type.
/// Implementations key registrations by `SubscriberId` and treat repeated
/// attach/detach calls for the same id as replace/no-op.
pub(crate) trait AnyCell: Send + Sync {
    /// Register `check` under `sub`; replaces any previous registration.
    fn attach_check(&self, sub: SubscriberId, check: CheckFn);

    /// Remove the registration under `sub`. Idempotent.
    fn detach_check(&self, sub: SubscriberId);
}
