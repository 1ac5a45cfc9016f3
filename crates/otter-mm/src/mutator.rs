//! Mutator handle
//!
//! A [`Mutator`] is the attached state of one application thread. It owns
//! the thread-local allocation queues, polls safepoints and switches between
//! the runnable and native states. It is neither `Send` nor `Sync`: it lives
//! and dies on the thread that attached it.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;

use crate::allocator::AllocatorThreadData;
use crate::gc_state::Epoch;
use crate::object::{ObjRef, TypeInfo};
use crate::roots::StableRef;
use crate::runtime::GlobalData;
use crate::safepoint::RecursionGuard;
use crate::scheduler::delay::GcDelayGuard;
use crate::thread::{
    ThreadData, ThreadState, current_thread, is_current_thread_attached, set_current_thread,
};
use crate::weak_ref::{WeakRef, WeakSlot};

/// Attached mutator thread
pub struct Mutator {
    global: Arc<GlobalData>,
    thread: Arc<ThreadData>,
    local: RefCell<AllocatorThreadData>,
    gc_delay_depth: Cell<u32>,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    pub(crate) fn attach(global: Arc<GlobalData>, name: String) -> Self {
        assert!(
            !is_current_thread_attached(),
            "thread is already attached as a mutator"
        );
        let thread = global.threads.register(name);
        set_current_thread(Some(thread.clone()));
        thread.leave_native(&global.suspension);
        tracing::debug!(target: "otter::gc", thread = thread.id(), name = thread.name(), "mutator attached");
        Self {
            global,
            thread,
            local: RefCell::new(AllocatorThreadData::default()),
            gc_delay_depth: Cell::new(0),
            _not_send: PhantomData,
        }
    }

    /// Shared state of this thread
    pub fn thread_data(&self) -> &ThreadData {
        &self.thread
    }

    /// Poll for pending collector requests
    #[inline]
    #[track_caller]
    pub fn safe_point(&self) {
        if self.global.safepoints.is_active() {
            self.safe_point_slow(Location::caller());
        }
    }

    #[cold]
    #[inline(never)]
    fn safe_point_slow(&self, site: &'static Location<'static>) {
        let Some(_guard) = RecursionGuard::enter() else {
            return;
        };
        if !self.global.safepoints.counter().is_active_acquire() {
            return;
        }
        let global = &self.global;
        global.barriers.on_checkpoint(&self.thread);

        if global.suspension.is_requested() {
            self.local.borrow_mut().publish(&global.allocator);
            global.suspension.suspend_if_requested(&self.thread);
        }

        if let Some(epoch) = global.scheduler.assists().pending_epoch() {
            self.assist(epoch);
        }

        global.scheduler.gc_data().safe_point(site);

        if let Some(action) = global.safepoints.action() {
            action(&self.thread);
        }
    }

    fn assist(&self, epoch: Epoch) {
        let gc_delay = self.global.scheduler.gc_delay();
        // Holding the gate: only park if the collector is not already
        // waiting for us to release it
        if self.gc_delay_depth.get() > 0 && !gc_delay.try_gc_assist(epoch) {
            return;
        }
        tracing::trace!(target: "otter::gc", thread = self.thread.id(), epoch, "assisting");
        self.global
            .scheduler
            .assists()
            .safe_point(&self.thread.assists, epoch, |wait| self.run_native(wait));
    }

    /// Allocate a zeroed fixed-size object
    #[track_caller]
    pub fn allocate_object(&self, type_info: &'static TypeInfo) -> ObjRef {
        self.allocate(type_info, 0, Location::caller())
    }

    /// Allocate a zeroed array of `count` elements
    #[track_caller]
    pub fn allocate_array(&self, type_info: &'static TypeInfo, count: usize) -> ObjRef {
        self.allocate(type_info, count, Location::caller())
    }

    fn allocate(
        &self,
        type_info: &'static TypeInfo,
        count: usize,
        site: &'static Location<'static>,
    ) -> ObjRef {
        if self.global.safepoints.is_active() {
            self.safe_point_slow(site);
        }

        let mut allocated = self.try_allocate(type_info, count);
        if allocated.is_none() {
            tracing::warn!(
                target: "otter::gc",
                ty = type_info.name(),
                count,
                "allocation failed, forcing a collection"
            );
            self.schedule_and_wait_finished();
            allocated = self.try_allocate(type_info, count);
        }
        let Some((obj, total)) = allocated else {
            let layout = type_info
                .instance_layout(count)
                .unwrap_or(std::alloc::Layout::new::<u8>());
            std::alloc::handle_alloc_error(layout)
        };

        // Born marked while the weak barrier checks marks of this epoch
        let barriers = &self.global.barriers;
        if barriers.weak_ref_barriers_enabled() {
            obj.object_data().try_mark(barriers.marking_epoch());
        }

        self.global.scheduler.gc_data().set_allocated_bytes(total);
        obj
    }

    fn try_allocate(&self, type_info: &'static TypeInfo, count: usize) -> Option<(ObjRef, usize)> {
        self.local
            .borrow_mut()
            .allocate(&self.global.allocator, type_info, count)
    }

    /// Make every allocation of this thread visible to the collector
    pub fn publish(&self) {
        let allocator = &self.global.allocator;
        if self.local.borrow_mut().try_publish(allocator) {
            return;
        }
        // The collector is iterating the stores; wait for it off the managed heap
        self.thread.enter_native();
        self.local.borrow_mut().publish(allocator);
        self.thread.leave_native(&self.global.suspension);
    }

    /// Objects allocated but not yet published
    pub fn unpublished_objects(&self) -> usize {
        self.local.borrow().pending_objects()
    }

    /// Run `f` in the native state. `f` must not touch the managed heap; the
    /// collector treats this thread as stopped until `f` returns.
    pub fn run_native<R>(&self, f: impl FnOnce() -> R) -> R {
        // Objects left behind stay in the local queue, out of the sweep's reach
        if !self.local.borrow_mut().try_publish(&self.global.allocator) {
            tracing::trace!(
                target: "otter::gc",
                thread = self.thread.id(),
                pending = self.local.borrow().pending_objects(),
                "stores busy, going native unpublished"
            );
        }
        self.thread.enter_native();
        let result = f();
        self.thread.leave_native(&self.global.suspension);
        result
    }

    /// Schedule a collection without waiting
    pub fn schedule(&self) -> Epoch {
        self.global.scheduler.schedule()
    }

    /// Schedule a collection and wait, in the native state, until it is finished
    pub fn schedule_and_wait_finished(&self) -> Epoch {
        let epoch = self.schedule();
        let gc_state = &self.global.gc_state;
        self.run_native(|| gc_state.wait_epoch_finished(epoch));
        epoch
    }

    /// Schedule a collection and wait, in the native state, until its
    /// finalizers have run
    pub fn schedule_and_wait_finalized(&self) -> Epoch {
        let epoch = self.schedule();
        let gc_state = &self.global.gc_state;
        self.run_native(|| gc_state.wait_epoch_finalized(epoch));
        epoch
    }

    /// Push a local root
    pub fn push_root(&self, obj: ObjRef) {
        self.thread.push_local_root(obj);
    }

    /// Pop the last local root
    pub fn pop_root(&self) -> Option<ObjRef> {
        self.thread.pop_local_root()
    }

    /// Root `obj` globally until the handle is dropped
    pub fn create_stable_ref(&self, obj: ObjRef) -> StableRef {
        self.global.roots.create_stable_ref(obj)
    }

    /// Weak reference to `obj`. Every weak reference to the same object
    /// shares one slot.
    pub fn create_weak_ref(&self, obj: ObjRef) -> WeakRef {
        let extra = self.local.borrow_mut().allocate_extra(obj);
        let mut created = false;
        let slot = extra.weak_slot_or_init(|| {
            created = true;
            Arc::new(WeakSlot::new(obj))
        });
        if created {
            self.global.weak_refs.register(&slot);
        }
        WeakRef::new(slot)
    }

    /// Read a weak reference through the barrier
    pub fn read_weak(&self, weak: &WeakRef) -> Option<ObjRef> {
        weak.read(&self.global.barriers)
    }

    /// Run `cleanup` on the finalizer thread once `obj` is found dead
    pub fn set_native_cleanup(&self, obj: ObjRef, cleanup: impl FnOnce() + Send + 'static) {
        let extra = self.local.borrow_mut().allocate_extra(obj);
        extra.set_associated_object(Box::new(cleanup));
    }

    /// Hold off the start of collections (up to the configured maximum
    /// delay) while the guard lives
    pub fn disallow_gc(&self) -> MutatorGcDelay<'_> {
        self.gc_delay_depth.set(self.gc_delay_depth.get() + 1);
        MutatorGcDelay {
            mutator: self,
            _guard: GcDelayGuard::new(self.global.scheduler.gc_delay()),
        }
    }

    /// Free every object this thread has not published, without finalization
    pub fn clear_for_tests(&self) {
        self.local
            .borrow_mut()
            .clear_for_tests(&self.global.allocator);
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if self.thread.state() == ThreadState::Runnable {
            self.thread.enter_native();
        }
        self.local.get_mut().publish(&self.global.allocator);
        self.global.threads.unregister(&self.thread);
        if current_thread().is_some_and(|t| Arc::ptr_eq(&t, &self.thread)) {
            set_current_thread(None);
        }
        tracing::debug!(target: "otter::gc", thread = self.thread.id(), "mutator detached");
    }
}

/// GC delay held by a mutator
#[must_use = "collections are delayed only while the guard lives"]
pub struct MutatorGcDelay<'a> {
    mutator: &'a Mutator,
    _guard: GcDelayGuard<'a>,
}

impl Drop for MutatorGcDelay<'_> {
    fn drop(&mut self) {
        let depth = &self.mutator.gc_delay_depth;
        depth.set(depth.get() - 1);
    }
}
