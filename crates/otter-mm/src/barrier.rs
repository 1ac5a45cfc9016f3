//! Weak reference read barrier for the concurrent collector
//!
//! Between the end of marking and the end of weak processing, mutators run
//! while unmarked objects still sit in the heap. During that window every
//! weak read checks the referent's mark and treats unmarked referents as
//! already dead, so a referent the collector is about to clear never escapes.
//!
//! Turning the barrier off is a handshake: after clearing the flag the
//! collector waits until each mutator has passed a safepoint checkpoint (or
//! is suspended or native), so no read that started with the barrier on is
//! still in flight when the sweep frees memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::gc_state::Epoch;
use crate::object::ObjRef;
use crate::safepoint::SafePoints;
use crate::thread::{ThreadData, ThreadRegistry};

/// Per-thread barrier state
#[derive(Debug, Default)]
pub struct BarriersThreadData {
    visited_checkpoint: AtomicBool,
}

impl BarriersThreadData {
    fn reset_checkpoint(&self) {
        self.visited_checkpoint.store(false, Ordering::SeqCst);
    }

    /// Has the thread passed a checkpoint since the last reset
    pub fn visited_checkpoint(&self) -> bool {
        self.visited_checkpoint.load(Ordering::SeqCst)
    }
}

/// Global barrier state
#[derive(Debug, Default)]
pub struct Barriers {
    weak_ref_barriers: CachePadded<AtomicBool>,
    marking_epoch: AtomicU64,
}

impl Barriers {
    /// Barrier flag
    #[inline]
    pub fn weak_ref_barriers_enabled(&self) -> bool {
        self.weak_ref_barriers.load(Ordering::Acquire)
    }

    /// Epoch whose marks the barrier checks
    pub fn marking_epoch(&self) -> Epoch {
        self.marking_epoch.load(Ordering::Acquire)
    }

    /// Turn the barrier on for `epoch`. Called with the world stopped.
    pub fn enable_weak_ref_barriers(&self, epoch: Epoch) {
        self.marking_epoch.store(epoch, Ordering::Release);
        self.weak_ref_barriers.store(true, Ordering::SeqCst);
    }

    /// Turn the barrier off and wait until every mutator has observed it.
    pub fn disable_weak_ref_barriers(&self, registry: &ThreadRegistry, safepoints: &SafePoints) {
        self.weak_ref_barriers.store(false, Ordering::SeqCst);
        for thread in registry.lock_for_iter().iter() {
            thread.barriers.reset_checkpoint();
        }
        let _activator = safepoints.activate();
        registry.wait_all_threads(|t| t.barriers.visited_checkpoint() || t.is_suspended_or_native());
    }

    /// Called by a mutator on the safepoint slow path
    pub(crate) fn on_checkpoint(&self, thread: &ThreadData) {
        thread
            .barriers
            .visited_checkpoint
            .store(true, Ordering::SeqCst);
    }

    /// Filter a weak referent through the barrier
    #[inline]
    pub fn weak_ref_read(&self, referent: Option<ObjRef>) -> Option<ObjRef> {
        let obj = referent?;
        if self.weak_ref_barriers_enabled() && !obj.is_marked_in(self.marking_epoch()) {
            return None;
        }
        Some(obj)
    }
}
