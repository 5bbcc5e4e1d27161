//! Batch scheduler.
//!
//! A batch is a dynamic scope during which notify-checks are deferred into a
//! pending queue instead of running immediately. The queue is keyed by cell
//! identity and preserves first-enqueued order, so:
//!
//! 1. N writes to one cell inside a batch coalesce into a single check.
//!
//! 2. Unrelated cells are checked exactly once each, in the order they were
//!    first touched.
//!
//! 3. A diamond-shaped graph checks its join point once per batch, not once
//!    per incoming edge: the join point's id is already pending when the
//!    second branch requests it.
//!
//! Batches nest; only the outermost scope flushes. Checks requested *during*
//! the flush (dependents notified by an earlier check) append to the same
//! queue and are drained in the same pass.

use std::cell::{Cell, RefCell};

use indexmap::IndexMap;
use tracing::trace;

use crate::observable::{CellId, CheckFn};

struct BatchState {
    depth: Cell<usize>,
    flushing: Cell<bool>,
    queue: RefCell<IndexMap<CellId, CheckFn>>,
}

thread_local! {
    static BATCH: BatchState = BatchState {
        depth: Cell::new(0),
        flushing: Cell::new(false),
        queue: RefCell::new(IndexMap::new()),
    };
}

/// Run `action` inside a batch scope and return its result.
///
/// Writes performed inside the scope defer their notify-checks; the
/// outermost `batch` call flushes them once on exit. Nested calls share the
/// outer scope's pending queue.
///
/// The flush also runs when `action` unwinds: the writes it performed are
/// already applied, and their subscribers must still hear about them.
pub fn batch<R>(action: impl FnOnce() -> R) -> R {
    BATCH.with(|b| b.depth.set(b.depth.get() + 1));
    let _guard = BatchGuard;
    action()
}

struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let outermost = BATCH.with(|b| {
            let depth = b.depth.get() - 1;
            b.depth.set(depth);
            depth == 0 && !b.flushing.get()
        });
        if outermost {
            flush();
        }
    }
}

/// Request a notify-check for `id`.
///
/// Runs immediately when no batch is active. Otherwise the check is
/// enqueued, coalescing on `id`: at most one check per cell per batch,
/// run in first-enqueued order.
pub(crate) fn schedule(id: CellId, check: CheckFn) {
    let run_now = BATCH.with(|b| {
        if b.depth.get() > 0 || b.flushing.get() {
            b.queue.borrow_mut().entry(id).or_insert_with(|| check.clone());
            false
        } else {
            true
        }
    });
    if run_now {
        check();
    }
}

/// Drain the pending queue front to back, tolerating growth while it runs.
fn flush() {
    let pending = BATCH.with(|b| {
        b.flushing.set(true);
        b.queue.borrow().len()
    });
    trace!(pending, "flushing batch");
    let _guard = FlushGuard;

    let mut index = 0;
    loop {
        let next = BATCH.with(|b| {
            b.queue
                .borrow()
                .get_index(index)
                .map(|(_, check)| check.clone())
        });
        match next {
            Some(check) => {
                index += 1;
                check();
            }
            None => break,
        }
    }
}

/// Clears flush state on exit — panic included — so a throwing check cannot
/// wedge the scheduler.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        BATCH.with(|b| {
            b.queue.borrow_mut().clear();
            b.flushing.set(false);
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn batch_returns_the_action_result() {
        assert_eq!(batch(|| "done"), "done");
    }

    #[test]
    fn schedule_runs_immediately_outside_a_batch() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        schedule(
            CellId::new(),
            Arc::new(move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_coalesces_by_id_inside_a_batch() {
        let runs = Arc::new(AtomicUsize::new(0));
        let id = CellId::new();
        batch(|| {
            for _ in 0..5 {
                let runs_clone = runs.clone();
                schedule(
                    id,
                    Arc::new(move || {
                        runs_clone.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
            // Deferred until the scope exits.
            assert_eq!(runs.load(Ordering::SeqCst), 0);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_flush_once_at_the_outermost_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        batch(|| {
            batch(|| {
                schedule(
                    CellId::new(),
                    Arc::new(move || {
                        runs_clone.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            });
            // Still pending: the inner scope is not the outermost.
            assert_eq!(runs.load(Ordering::SeqCst), 0);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checks_scheduled_during_a_flush_drain_in_the_same_pass() {
        let second = Arc::new(AtomicUsize::new(0));
        let second_clone = second.clone();
        batch(|| {
            schedule(
                CellId::new(),
                Arc::new(move || {
                    let second = second_clone.clone();
                    schedule(
                        CellId::new(),
                        Arc::new(move || {
                            second.fetch_add(1, Ordering::SeqCst);
                        }),
                    );
                }),
            );
        });
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_runs_in_first_enqueued_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        batch(|| {
            for tag in ["b", "a", "c"] {
                let order = order.clone();
                schedule(
                    CellId::new(),
                    Arc::new(move || {
                        order.lock().push(tag);
                    }),
                );
            }
        });
        assert_eq!(*order.lock(), vec!["b", "a", "c"]);
    }

    #[test]
    fn panicking_action_still_flushes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let result = std::panic::catch_unwind(|| {
            batch(|| {
                schedule(
                    CellId::new(),
                    Arc::new(move || {
                        runs_clone.fetch_add(1, Ordering::SeqCst);
                    }),
                );
                panic!("action failed");
            });
        });
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
