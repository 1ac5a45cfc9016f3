//! Collection orchestration
//!
//! A dedicated GC thread waits for scheduled epochs and runs one full
//! collection per epoch, walking the [`CollectorPhase`] state machine:
//!
//! ```text
//! Idle -> Scheduled(epoch) -> ThreadsSuspending -> ThreadsSuspended
//!      -> RootSetCollected -> Marked -> WeaksProcessed -> Swept
//!      -> FinalizersScheduled -> Idle
//! ```
//!
//! The stop-the-world variant keeps mutators suspended until the sweep is
//! done. The concurrent variant resumes them right after marking and
//! processes weak references behind the weak-reference barrier, then sweeps
//! while they run. The no-op variant completes epochs without collecting.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::PendingFinalizers;
use crate::config::GcKind;
use crate::gc_state::Epoch;
use crate::mark::{MarkQueue, collect_root_set, mark};
use crate::roots::RootSet;
use crate::runtime::GlobalData;
use crate::statistics::GcHandle;

/// Collector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// Waiting for a scheduled epoch
    Idle,
    /// Collection of the epoch is starting
    Scheduled(Epoch),
    /// Suspension requested, waiting for mutators
    ThreadsSuspending,
    /// Every mutator is suspended or native
    ThreadsSuspended,
    /// Roots are in the mark queue
    RootSetCollected,
    /// Marking finished
    Marked,
    /// Dead weak referents cleared
    WeaksProcessed,
    /// Unmarked objects reclaimed
    Swept,
    /// Finalizer queue handed over
    FinalizersScheduled,
}

impl CollectorPhase {
    fn can_advance_to(self, next: CollectorPhase) -> bool {
        use CollectorPhase::*;
        matches!(
            (self, next),
            (Idle, Scheduled(_))
                | (Scheduled(_), ThreadsSuspending)
                | (Scheduled(_), Idle)
                | (ThreadsSuspending, ThreadsSuspended)
                | (ThreadsSuspended, RootSetCollected)
                | (RootSetCollected, Marked)
                | (Marked, WeaksProcessed)
                | (WeaksProcessed, Swept)
                | (Swept, FinalizersScheduled)
                | (FinalizersScheduled, Idle)
        )
    }
}

/// Collector variant plus its phase
#[derive(Debug)]
pub struct Collector {
    kind: GcKind,
    phase: Mutex<CollectorPhase>,
}

impl Collector {
    /// Idle collector of the given variant
    pub fn new(kind: GcKind) -> Self {
        Self {
            kind,
            phase: Mutex::new(CollectorPhase::Idle),
        }
    }

    /// Variant
    pub fn kind(&self) -> GcKind {
        self.kind
    }

    /// Current phase
    pub fn phase(&self) -> CollectorPhase {
        *self.phase.lock()
    }

    fn advance(&self, next: CollectorPhase) {
        let mut phase = self.phase.lock();
        assert!(
            phase.can_advance_to(next),
            "invalid collector transition {:?} -> {:?}",
            *phase,
            next
        );
        *phase = next;
    }

    /// Run the collection of `epoch`
    pub(crate) fn perform_full_gc(&self, global: &GlobalData, epoch: Epoch) {
        self.advance(CollectorPhase::Scheduled(epoch));
        match self.kind {
            GcKind::NoOp => self.complete_without_collecting(global, epoch),
            GcKind::StopTheWorld => self.collect_stop_the_world(global, epoch),
            GcKind::Concurrent => self.collect_concurrent(global, epoch),
        }
    }

    fn complete_without_collecting(&self, global: &GlobalData, epoch: Epoch) {
        global.scheduler.on_gc_start();
        global.gc_state.start(epoch);
        global
            .scheduler
            .on_gc_finish(epoch, global.allocator.allocated_bytes(), &global.threads);
        self.advance(CollectorPhase::Idle);
        tracing::debug!(target: "otter::gc", epoch, "no-op collection");
        global.gc_state.finish(epoch);
        global.gc_state.finalized(epoch);
    }

    /// Suspend the world, collect roots and mark. Leaves mutators suspended.
    fn suspend_and_mark(&self, global: &GlobalData, epoch: Epoch, handle: &mut GcHandle<'_>) {
        global
            .scheduler
            .gc_delay()
            .wait_gc_allowed(epoch, global.config.max_gc_delay);

        self.advance(CollectorPhase::ThreadsSuspending);
        let requested = global
            .suspension
            .request_threads_suspension(&global.safepoints);
        assert!(requested, "epoch {epoch}: threads suspension already requested");
        handle.suspension_requested();
        global.suspension.wait_for_threads_suspension(&global.threads);
        self.advance(CollectorPhase::ThreadsSuspended);
        handle.threads_suspended();

        global.scheduler.on_gc_start();
        global.gc_state.start(epoch);

        let mut queue = MarkQueue::default();
        let roots = {
            let mut root_sets: Vec<&dyn RootSet> = Vec::with_capacity(2);
            root_sets.push(&global.roots);
            if let Some(extra) = &global.extra_roots {
                root_sets.push(extra.as_ref());
            }
            collect_root_set(epoch, &global.threads, &root_sets, &mut queue)
        };
        self.advance(CollectorPhase::RootSetCollected);
        handle.root_set_collected(roots);

        let stats = mark(epoch, queue, roots);
        self.advance(CollectorPhase::Marked);
        handle.marked(stats);
    }

    fn collect_stop_the_world(&self, global: &GlobalData, epoch: Epoch) {
        let mut handle = GcHandle::create(
            &global.stats,
            epoch,
            self.kind,
            global.allocator.allocated_bytes(),
        );
        self.suspend_and_mark(global, epoch, &mut handle);

        let heap = global.allocator.prepare_for_gc(epoch);
        let cleared = global.weak_refs.process_weaks(epoch);
        self.advance(CollectorPhase::WeaksProcessed);
        handle.weaks_processed(cleared);

        let pending = heap.sweep();
        let alive_bytes = global.allocator.allocated_bytes();
        self.advance(CollectorPhase::Swept);
        handle.swept(pending.stats(), alive_bytes);

        global.suspension.resume_threads();
        handle.threads_resumed();

        self.finish_epoch(global, epoch, alive_bytes, pending, handle);
    }

    fn collect_concurrent(&self, global: &GlobalData, epoch: Epoch) {
        let mut handle = GcHandle::create(
            &global.stats,
            epoch,
            self.kind,
            global.allocator.allocated_bytes(),
        );
        self.suspend_and_mark(global, epoch, &mut handle);

        global.barriers.enable_weak_ref_barriers(epoch);
        let heap = global.allocator.prepare_for_gc(epoch);
        global.suspension.resume_threads();
        handle.threads_resumed();

        let cleared = global.weak_refs.process_weaks(epoch);
        global
            .barriers
            .disable_weak_ref_barriers(&global.threads, &global.safepoints);
        self.advance(CollectorPhase::WeaksProcessed);
        handle.weaks_processed(cleared);

        let pending = heap.sweep();
        let alive_bytes = global.allocator.allocated_bytes();
        self.advance(CollectorPhase::Swept);
        handle.swept(pending.stats(), alive_bytes);

        self.finish_epoch(global, epoch, alive_bytes, pending, handle);
    }

    /// Record the epoch, wake `finished` waiters, then hand over finalizers.
    /// Statistics are in place before any waiter can observe the epoch.
    fn finish_epoch(
        &self,
        global: &GlobalData,
        epoch: Epoch,
        alive_bytes: usize,
        pending: PendingFinalizers<'_>,
        mut handle: GcHandle<'_>,
    ) {
        global
            .scheduler
            .on_gc_finish(epoch, alive_bytes, &global.threads);
        handle.finalizers_scheduled(pending.len());
        handle.finished();

        global.gc_state.finish(epoch);
        pending.dispatch();
        self.advance(CollectorPhase::FinalizersScheduled);
        self.advance(CollectorPhase::Idle);
    }
}

/// Body of the GC thread
pub(crate) fn gc_thread_loop(global: Arc<GlobalData>) {
    tracing::debug!(target: "otter::gc", kind = ?global.collector.kind(), "GC thread started");
    while let Some(epoch) = global.gc_state.wait_scheduled() {
        global.collector.perform_full_gc(&global, epoch);
    }
    tracing::debug!(target: "otter::gc", "GC thread stopped");
}
