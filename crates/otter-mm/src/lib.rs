//! # Otter Memory Manager
//!
//! Tracing garbage collector and thread-local allocator for a heap shared by
//! many mutator threads.
//!
//! ## Design
//!
//! - **Allocation**: each mutator allocates into its own queue without
//!   synchronization and publishes into a global store at safepoints, when
//!   going native and on detach
//! - **Scheduling**: heap growth boundaries, a regular timer and mutator
//!   assists decide when an epoch is collected ([`scheduler`])
//! - **Collection**: a dedicated GC thread suspends mutators, marks from the
//!   root set, clears dead weak references, sweeps, and hands objects with
//!   native cleanups to the finalizer thread ([`collector`])
//! - **Variants**: stop-the-world, concurrent (weak processing and sweep run
//!   with mutators resumed behind a weak-reference barrier) and no-op,
//!   selected at runtime through [`GcConfig`]

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod error;
pub mod extra;
pub mod finalizer;
pub mod gc_state;
pub mod mark;
pub mod mutator;
pub mod object;
pub mod roots;
pub mod runtime;
pub mod safepoint;
pub mod scheduler;
pub mod statistics;
mod store;
pub mod suspension;
pub mod thread;
pub mod weak_ref;

pub use allocator::{Allocator, MarkedHeap, PendingFinalizers, SweepStats};
pub use collector::CollectorPhase;
pub use config::{GcConfig, GcKind, GcSchedulerConfig, SchedulerKind};
pub use error::{ConfigError, Result};
pub use gc_state::Epoch;
pub use mark::MarkStats;
pub use mutator::{Mutator, MutatorGcDelay};
pub use object::{ObjRef, TypeInfo, TypeLayout};
pub use roots::{RootSet, StableRef};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeHandle};
pub use safepoint::SafePointAction;
pub use scheduler::AppState;
pub use statistics::{GcEpochStats, GcTotals};
pub use thread::{ThreadData, ThreadState, is_current_thread_attached};
pub use weak_ref::WeakRef;
