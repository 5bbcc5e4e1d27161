//! Dependency-tracking context.
//!
//! The tracking context attributes cell reads to the computation currently
//! evaluating. When a computed cell or watcher runs its getter, it pushes a
//! collector frame; every tracked read inside the getter records itself into
//! that frame. This is what makes dependencies dynamic: they are whatever
//! the getter actually read on its last run.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Nested evaluation (a computed cell
//! reading another computed cell) pushes a new frame on top, so reads are
//! always attributed to the innermost evaluation. Frames are popped by an
//! RAII guard, panic included — a throwing getter must never leave a stale
//! collector active, or every subsequent read would be attributed to the
//! wrong cell.
//!
//! Thread-locality also keeps independent graphs on different threads (for
//! example Rust's parallel test harness) from interfering with each other.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::observable::{AnyCell, CellId, CheckFn};
use crate::subscriber::SubscriberId;

/// One recorded dependency read.
#[derive(Clone)]
pub(crate) struct DepRecord {
    pub id: CellId,
    /// Non-owning handle used to attach/detach the dependent's check.
    /// A dead handle means the dependency was dropped; edge operations on it
    /// are no-ops.
    pub handle: Weak<dyn AnyCell>,
    /// Re-peeks the dependency and reports whether its value still matches
    /// the one recorded at evaluation time, under the dependency's own
    /// change policy. A dropped dependency matches.
    pub unchanged: Arc<dyn Fn() -> bool + Send + Sync>,
}

pub(crate) type DepList = SmallVec<[DepRecord; 4]>;

/// Subscription identity of the evaluating cell. Present only while that
/// cell has subscribers: edges are materialized on demand, reads are always
/// recorded.
#[derive(Clone)]
pub(crate) struct AttachCtx {
    pub sub: SubscriberId,
    pub request: CheckFn,
}

enum Frame {
    /// A computed cell or watcher is evaluating; reads are collected.
    Collect {
        records: DepList,
        attach: Option<AttachCtx>,
    },
    /// Registration is suppressed (`untracked`).
    Inert,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// RAII frame guard.
///
/// Pops its frame on drop — panic included — so the LIFO discipline of the
/// stack survives a throwing getter.
pub(crate) struct TrackScope {
    finished: bool,
}

impl TrackScope {
    /// Push a collector frame for an evaluating cell.
    pub fn collect(attach: Option<AttachCtx>) -> Self {
        STACK.with(|stack| {
            stack.borrow_mut().push(Frame::Collect {
                records: DepList::new(),
                attach,
            });
        });
        Self { finished: false }
    }

    /// Push a suppression frame: reads underneath register nothing.
    pub fn inert() -> Self {
        STACK.with(|stack| stack.borrow_mut().push(Frame::Inert));
        Self { finished: false }
    }

    /// Pop the frame and hand back the recorded dependencies.
    pub fn finish(mut self) -> DepList {
        self.finished = true;
        STACK.with(|stack| match stack.borrow_mut().pop() {
            Some(Frame::Collect { records, .. }) => records,
            _ => DepList::new(),
        })
    }
}

impl Drop for TrackScope {
    fn drop(&mut self) {
        if !self.finished {
            STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
}

/// Record a dependency read in the active collector frame, if any.
///
/// `make` runs only when a collector is active, so untracked reads pay a
/// single thread-local check. The same dependency read twice in one
/// evaluation is recorded once.
///
/// Attaching the dependent's check happens after the stack borrow is
/// released: attaching to a computed dependency with no prior subscribers
/// forces that dependency's own evaluation, which pushes a new frame.
pub(crate) fn record(make: impl FnOnce() -> DepRecord) {
    let attach = STACK.with(|stack| match stack.borrow().last() {
        Some(Frame::Collect { attach, .. }) => Some(attach.clone()),
        _ => None,
    });
    let attach = match attach {
        Some(attach) => attach,
        None => return,
    };

    let rec = make();
    let fresh = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(Frame::Collect { records, .. }) => {
                if records.iter().any(|r| r.id == rec.id) {
                    false
                } else {
                    records.push(rec.clone());
                    true
                }
            }
            _ => false,
        }
    });
    if !fresh {
        return;
    }

    if let Some(ctx) = attach {
        if let Some(dep) = rec.handle.upgrade() {
            dep.attach_check(ctx.sub, ctx.request.clone());
        }
    }
}

/// Run `f` with dependency registration suppressed.
///
/// Reads inside `f` behave like `peek` even while a computed cell or watcher
/// is evaluating. Used internally to run watcher cleanups outside the graph;
/// exported for consumers that need a read to stay out of the graph.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _scope = TrackScope::inert();
    f()
}

#[cfg(test)]
pub(crate) fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
