//! Weft Core
//!
//! This crate provides the reactive value graph at the heart of the Weft
//! framework. It implements:
//!
//! - Writable cells ([`Signal`]) and lazily evaluated, memoized derived
//!   cells ([`Computed`])
//! - Automatic dependency tracking: a computed cell's dependencies are
//!   whatever it read during its last evaluation
//! - Subscription-gated dependency edges: the graph only materializes
//!   edges for cells somebody observes
//! - A bounded per-cell memo cache of prior dependency/result snapshots
//! - Coalescing write batches ([`batch`]) that notify each affected cell at
//!   most once, diamond-shaped graphs included
//! - Eager, disposable side-effect subscribers ([`watch`])
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. When its value is read
//! inside a tracking context (a computed cell or watcher evaluation), the
//! signal registers itself as a dependency of that computation. When the
//! value changes, dependents are notified.
//!
//! ## Computed cells
//!
//! A [`Computed`] derives its value from other cells and caches the result
//! together with a snapshot of the inputs it was computed from. It is
//! pull-evaluated: writes never recompute it eagerly, they only ask it
//! "did your value change?", and answering that question lazily recomputes
//! when no cached snapshot matches.
//!
//! ## Watchers
//!
//! The [`watch`] family runs a side effect immediately and again whenever
//! any cell it read changes, with optional cleanup between runs. Watchers
//! are how reactive state reaches the outside world.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::{batch, watch, Computed, Signal};
//!
//! let count = Signal::new(1);
//! let doubled = {
//!     let count = count.clone();
//!     Computed::new(move || count.get() * 2)
//! };
//!
//! let _handle = {
//!     let doubled = doubled.clone();
//!     watch(move || println!("doubled is {}", doubled.get()))
//! };
//!
//! batch(|| {
//!     count.set(2);
//!     count.set(3);
//! });
//! // prints "doubled is 6" exactly once
//! ```
//!
//! # Implementation Notes
//!
//! Dependency attribution uses a thread-local stack of collector frames
//! (sometimes called "automatic dependency tracking" or "transparent
//! reactivity", the approach used by SolidJS, Vue 3, and Leptos). The graph
//! is designed for a single logical thread of control; handles are
//! `Send + Sync`, but tracking and batching are per-thread.

mod batch;
mod computed;
mod context;
mod effect;
mod observable;
mod signal;
mod subscriber;

pub use batch::batch;
pub use computed::{Computed, ComputedOptions};
pub use context::untracked;
pub use effect::{watch, watch_named, watch_with_cleanup, Cleanup, WatchHandle};
pub use observable::{CellId, CellOptions, SignalValue};
pub use signal::Signal;
pub use subscriber::SubscriberId;
