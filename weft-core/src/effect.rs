//! Watchers: eager, disposable side-effect subscribers.
//!
//! A watcher runs an effect function immediately and again whenever any
//! cell it read changes — at most once per batch, because the rerun is
//! requested through the batch scheduler like any other notify-check.
//!
//! # Differences from Computed
//!
//! - Computed cells produce a value; watchers produce side effects.
//! - Computed cells are lazy; watchers are eagerly subscribed from
//!   construction and stay subscribed until disposed.
//! - Computed cells memoize; watchers never do — every trigger reruns the
//!   effect under fresh dependency collection.
//!
//! Internally a watcher *is* a zero-cache computed cell over `()` holding a
//! permanent subscriber, which is exactly what gives it those semantics.
//!
//! # Cleanup
//!
//! An effect may hand back a cleanup closure ([`watch_with_cleanup`]). The
//! previous cleanup runs — outside the graph, so its reads register nothing
//! — immediately before each rerun, and once more on disposal. This is the
//! hook for releasing whatever the effect acquired: listeners, timers,
//! handles.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::computed::{Computed, ComputedOptions};
use crate::context::untracked;
use crate::subscriber::SubscriberId;

/// Cleanup returned by a watcher effect; runs before the next invocation
/// and on disposal.
pub type Cleanup = Box<dyn FnOnce() + Send>;

type EffectFn = Box<dyn FnMut() -> Option<Cleanup> + Send>;

/// Disposer for a watcher created by the [`watch`] family.
///
/// Dropping the handle disposes the watcher: dependency edges are torn
/// down and the last cleanup runs.
pub struct WatchHandle {
    runner: Computed<()>,
    sub: SubscriberId,
    cleanup: Arc<Mutex<Option<Cleanup>>>,
}

/// Run `effect` now and again whenever any cell it read changes.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// let handle = watch(move || {
///     println!("count is {}", count.get());
/// });
///
/// count.set(5); // prints: count is 5
/// drop(handle); // no further reruns
/// ```
pub fn watch<F>(mut effect: F) -> WatchHandle
where
    F: FnMut() + Send + 'static,
{
    spawn(
        Box::new(move || {
            effect();
            None
        }),
        None,
    )
}

/// [`watch`] with a diagnostic name, surfaced in traces.
pub fn watch_named<F>(mut effect: F, name: impl Into<String>) -> WatchHandle
where
    F: FnMut() + Send + 'static,
{
    spawn(
        Box::new(move || {
            effect();
            None
        }),
        Some(name.into()),
    )
}

/// [`watch`] for effects that acquire resources: the cleanup returned by
/// each invocation runs before the next one and on disposal.
pub fn watch_with_cleanup<F, C>(mut effect: F) -> WatchHandle
where
    F: FnMut() -> C + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    spawn(Box::new(move || Some(Box::new(effect()) as Cleanup)), None)
}

fn spawn(effect: EffectFn, name: Option<String>) -> WatchHandle {
    let cleanup: Arc<Mutex<Option<Cleanup>>> = Arc::new(Mutex::new(None));
    let slot = cleanup.clone();
    let effect = Mutex::new(effect);

    let mut options = ComputedOptions::new().cache_size(0);
    if let Some(name) = name {
        options = options.named(name);
    }

    // The runner is a zero-cache computed cell: every notify-check reruns
    // the effect under fresh dependency collection.
    let runner = Computed::with_options(
        move || {
            if let Some(prev) = slot.lock().take() {
                untracked(prev);
            }
            let next = {
                let mut run = effect.lock();
                (*run)()
            };
            *slot.lock() = next;
        },
        options,
    );

    // The permanent subscription runs the effect once and materializes its
    // dependency edges.
    let sub = runner.observe(|_| {});
    WatchHandle {
        runner,
        sub,
        cleanup,
    }
}

impl WatchHandle {
    /// Dispose the watcher: tear down dependency edges and run the last
    /// cleanup. Equivalent to dropping the handle.
    pub fn dispose(self) {
        drop(self);
    }

    /// Diagnostic name, if one was given at construction.
    pub fn name(&self) -> Option<&str> {
        self.runner.name()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.runner.unsubscribe(self.sub);
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        debug!(cell = self.runner.id().raw(), name = ?self.runner.name(), "watcher disposed");
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("cell", &self.runner.id().raw())
            .field("name", &self.runner.name())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::batch;
    use crate::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn watch_runs_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let _handle = watch(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watch_reruns_when_a_dependency_changes() {
        let count = Signal::new(0);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        let _handle = {
            let (count, seen) = (count.clone(), seen.clone());
            watch(move || {
                seen.store(count.get() as usize, Ordering::SeqCst);
            })
        };
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        count.set(42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn watch_reruns_once_per_batch() {
        let a = Signal::new(1);
        let b = Signal::new(2);
        let runs = Arc::new(AtomicUsize::new(0));

        let _handle = {
            let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
            watch(move || {
                a.get();
                b.get();
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Both dependencies change in one batch: one rerun.
        batch(|| {
            a.set(10);
            b.set(20);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Outside a batch each write propagates on its own.
        a.set(11);
        b.set(21);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unchanged_write_does_not_rerun() {
        let a = Signal::new(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let _handle = {
            let (a, runs) = (a.clone(), runs.clone());
            watch(move || {
                a.get();
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        a.set(1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let count = Signal::new(0);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let (count, log) = (count.clone(), log.clone());
            watch_with_cleanup(move || {
                let v = count.get();
                log.lock().push(format!("run {v}"));
                let log = log.clone();
                move || log.lock().push(format!("clean {v}"))
            })
        };
        assert_eq!(*log.lock(), vec!["run 0"]);

        count.set(1);
        assert_eq!(*log.lock(), vec!["run 0", "clean 0", "run 1"]);

        handle.dispose();
        assert_eq!(*log.lock(), vec!["run 0", "clean 0", "run 1", "clean 1"]);
    }

    #[test]
    fn dispose_stops_reruns() {
        let count = Signal::new(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let handle = {
            let (count, runs) = (count.clone(), runs.clone());
            watch(move || {
                count.get();
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(count.subscriber_count(), 1);

        handle.dispose();
        assert_eq!(count.subscriber_count(), 0);

        count.set(5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watch_follows_branch_switches() {
        let flag = Signal::new(true);
        let a = Signal::new(1);
        let b = Signal::new(2);
        let runs = Arc::new(AtomicUsize::new(0));

        let _handle = {
            let (flag, a, b, runs) = (flag.clone(), a.clone(), b.clone(), runs.clone());
            watch(move || {
                if flag.get() {
                    a.get();
                } else {
                    b.get();
                }
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Not a dependency while the branch is untaken.
        b.set(99);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        flag.set(false);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        b.set(100);
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        a.set(50);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn watch_named_exposes_its_name() {
        let handle = watch_named(|| {}, "logger");
        assert_eq!(handle.name(), Some("logger"));
    }
}
