//! Allocator and sweep pipeline
//!
//! Each mutator owns an [`AllocatorThreadData`] that allocates without any
//! cross-thread synchronization and publishes into the shared [`Allocator`].
//! A collection drives the allocator through a typestate pipeline:
//!
//! ```text
//! Allocator::prepare_for_gc(epoch) -> MarkedHeap
//! MarkedHeap::sweep()              -> PendingFinalizers
//! PendingFinalizers::dispatch()       (hands the queue to the finalizer thread)
//! ```
//!
//! Dropping a `MarkedHeap` or `PendingFinalizers` without completing its step
//! is a fatal protocol violation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::MutexGuard;

use crate::extra::{ExtraObjectData, ExtraRef, extra_of, flags};
use crate::finalizer::{FinalizerProcessor, FinalizerQueue};
use crate::gc_state::Epoch;
use crate::object::{ObjRef, TypeInfo, allocate_instance, deallocate_instance};
use crate::store::{GlobalStore, ThreadQueue};

/// Counters produced by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects that survived
    pub kept_objects: usize,
    /// Bytes that survived
    pub kept_bytes: usize,
    /// Objects freed by the sweep
    pub swept_objects: usize,
    /// Bytes freed by the sweep
    pub swept_bytes: usize,
    /// Extra data records freed
    pub swept_extras: usize,
    /// Objects queued for finalization
    pub finalizers: usize,
}

/// Shared part of the allocator
pub struct Allocator {
    objects: GlobalStore<ObjRef>,
    extras: GlobalStore<ExtraRef>,
    allocated_bytes: Arc<CachePadded<AtomicUsize>>,
    prepared_epoch: AtomicU64,
    finalizers: FinalizerProcessor,
}

impl Allocator {
    /// Create an allocator; `on_finalized` is called once all finalizers of
    /// an epoch have run.
    pub fn new(on_finalized: impl Fn(Epoch) + Send + Sync + 'static) -> Self {
        let allocated_bytes = Arc::new(CachePadded::new(AtomicUsize::new(0)));
        let bytes = allocated_bytes.clone();
        Self {
            objects: GlobalStore::default(),
            extras: GlobalStore::default(),
            allocated_bytes,
            prepared_epoch: AtomicU64::new(0),
            finalizers: FinalizerProcessor::new(
                move |obj| run_finalizer(obj, &bytes),
                on_finalized,
            ),
        }
    }

    /// Bytes held by allocated objects, including unpublished ones and
    /// objects waiting for finalization
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Number of published objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of published extra data records
    pub fn extra_count(&self) -> usize {
        self.extras.len()
    }

    /// The finalizer thread owner
    pub fn finalizer_processor(&self) -> &FinalizerProcessor {
        &self.finalizers
    }

    /// Begin the epoch-scoped view of the heap.
    ///
    /// Every mutator must be published, suspended or native. Holds the store
    /// locks until the returned heap is swept.
    ///
    /// # Panics
    /// If `epoch` is not newer than the last prepared epoch.
    pub fn prepare_for_gc(&self, epoch: Epoch) -> MarkedHeap<'_> {
        let prev = self.prepared_epoch.fetch_max(epoch, Ordering::AcqRel);
        assert!(
            epoch > prev,
            "prepare_for_gc: epoch {epoch} is not newer than {prev}"
        );
        MarkedHeap {
            allocator: self,
            epoch,
            locked: Some((self.objects.lock_for_iter(), self.extras.lock_for_iter())),
        }
    }

    /// Free every published object without finalization.
    ///
    /// Test helper: objects must be unreachable, threads must have published.
    pub fn clear_for_tests(&self) {
        let mut objects = self.objects.lock_for_iter();
        let mut extras = self.extras.lock_for_iter();
        for obj in objects.drain(..) {
            self.free_unfinalized(obj);
        }
        for extra in extras.drain(..) {
            extra.get().detach();
            // SAFETY: detached, and the store held the only owning link
            unsafe { extra.destroy() }
        }
    }

    fn free_unfinalized(&self, obj: ObjRef) {
        if let Some(extra) = extra_of(obj) {
            extra.detach();
        }
        let size = obj.allocated_size();
        // SAFETY: removed from the store by the caller
        unsafe { deallocate_instance(obj) }
        self.allocated_bytes.fetch_sub(size, Ordering::AcqRel);
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.finalizers.stop_finalizer_thread_if_running();
        self.clear_for_tests();
    }
}

/// Runs on the finalizer thread
fn run_finalizer(obj: ObjRef, allocated_bytes: &AtomicUsize) {
    if let Some(extra) = extra_of(obj) {
        if let Some(cleanup) = extra.take_associated_object() {
            cleanup();
        }
        extra.set_flag(flags::FINALIZED);
        extra.detach();
        // Last touch: the next sweep may free it from here on
        extra.set_flag(flags::SWEEPABLE);
    }
    let size = obj.allocated_size();
    // SAFETY: the sweep removed the object from the store and handed it over
    unsafe { deallocate_instance(obj) }
    allocated_bytes.fetch_sub(size, Ordering::AcqRel);
}

/// Thread-owned allocation state
#[derive(Debug, Default)]
pub struct AllocatorThreadData {
    objects: ThreadQueue<ObjRef>,
    extras: ThreadQueue<ExtraRef>,
}

impl AllocatorThreadData {
    /// Allocate a zeroed instance. Returns the object and the new heap total,
    /// or `None` if the system allocator failed.
    pub(crate) fn allocate(
        &mut self,
        allocator: &Allocator,
        type_info: &'static TypeInfo,
        count: usize,
    ) -> Option<(ObjRef, usize)> {
        let obj = allocate_instance(type_info, count)?;
        self.objects.push(obj);
        let size = obj.allocated_size();
        let total = allocator.allocated_bytes.fetch_add(size, Ordering::AcqRel) + size;
        Some((obj, total))
    }

    /// Extra data of `obj`, attaching a fresh one if needed
    pub(crate) fn allocate_extra(&mut self, obj: ObjRef) -> &'static ExtraObjectData {
        if let Some(extra) = extra_of(obj) {
            return extra;
        }
        let extra = ExtraRef::new(ExtraObjectData::new(obj));
        match obj.install_extra(extra.as_non_null()) {
            Ok(()) => self.extras.push(extra),
            // SAFETY: lost the race, nobody else has seen this extra
            Err(_) => unsafe { extra.destroy() },
        }
        match extra_of(obj) {
            Some(extra) => extra,
            None => unreachable!("extra installed above"),
        }
    }

    /// Flush into the global stores, blocking while the collector iterates
    pub(crate) fn publish(&mut self, allocator: &Allocator) {
        self.objects.publish(&allocator.objects);
        self.extras.publish(&allocator.extras);
    }

    /// Flush unless the collector is iterating. Returns false if something
    /// was left behind.
    pub(crate) fn try_publish(&mut self, allocator: &Allocator) -> bool {
        let objects = self.objects.try_publish(&allocator.objects);
        let extras = self.extras.try_publish(&allocator.extras);
        objects && extras
    }

    /// Unpublished object count
    pub(crate) fn pending_objects(&self) -> usize {
        self.objects.len()
    }

    /// Free everything not yet published, without finalization
    pub(crate) fn clear_for_tests(&mut self, allocator: &Allocator) {
        for obj in self.objects.drain() {
            allocator.free_unfinalized(obj);
        }
        for extra in self.extras.drain() {
            extra.get().detach();
            // SAFETY: detached, never published
            unsafe { extra.destroy() }
        }
    }
}

type Locked<'a> = (MutexGuard<'a, Vec<ObjRef>>, MutexGuard<'a, Vec<ExtraRef>>);

/// Epoch-scoped view of the published heap
#[must_use = "a MarkedHeap must be swept"]
pub struct MarkedHeap<'a> {
    allocator: &'a Allocator,
    epoch: Epoch,
    locked: Option<Locked<'a>>,
}

impl<'a> MarkedHeap<'a> {
    /// Epoch this view belongs to
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn objects(&self) -> &[ObjRef] {
        match &self.locked {
            Some((objects, _)) => objects,
            None => unreachable!("MarkedHeap used after sweep"),
        }
    }

    /// Number of objects visible at epoch start
    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    /// Visit every object visible at epoch start
    pub fn traverse_objects(&self, mut f: impl FnMut(ObjRef)) {
        for &obj in self.objects() {
            f(obj);
        }
    }

    /// Reclaim unmarked objects, queueing those that need finalization.
    /// Releases the store locks before returning.
    pub fn sweep(mut self) -> PendingFinalizers<'a> {
        let Some((mut objects, mut extras)) = self.locked.take() else {
            unreachable!("MarkedHeap swept twice");
        };
        let epoch = self.epoch;
        let mut stats = SweepStats::default();
        let mut queue = FinalizerQueue::new();

        objects.retain(|&obj| {
            let size = obj.allocated_size();
            if obj.is_marked_in(epoch) {
                stats.kept_objects += 1;
                stats.kept_bytes += size;
                return true;
            }
            match extra_of(obj) {
                Some(extra) if extra.has_associated_object() => {
                    stats.finalizers += 1;
                    queue.push(obj);
                }
                extra => {
                    if let Some(extra) = extra {
                        extra.set_flag(flags::FINALIZED);
                        extra.detach();
                        extra.set_flag(flags::SWEEPABLE);
                    }
                    // SAFETY: unmarked, so unreachable; removed from the store here
                    unsafe { deallocate_instance(obj) }
                    stats.swept_objects += 1;
                    stats.swept_bytes += size;
                }
            }
            false
        });

        extras.retain(|&extra| {
            if extra.get().has_flag(flags::SWEEPABLE) {
                // SAFETY: sweepable extras are detached and touched by nobody
                unsafe { extra.destroy() }
                stats.swept_extras += 1;
                false
            } else {
                true
            }
        });

        self.allocator
            .allocated_bytes
            .fetch_sub(stats.swept_bytes, Ordering::AcqRel);
        drop(extras);
        drop(objects);

        PendingFinalizers {
            processor: &self.allocator.finalizers,
            epoch,
            queue: Some(queue),
            stats,
        }
    }
}

impl Drop for MarkedHeap<'_> {
    fn drop(&mut self) {
        if self.locked.is_some() && !std::thread::panicking() {
            panic!("MarkedHeap for epoch {} dropped without sweep", self.epoch);
        }
    }
}

/// Result of a sweep: objects waiting to be handed to the finalizer thread
#[must_use = "PendingFinalizers must be dispatched"]
pub struct PendingFinalizers<'a> {
    processor: &'a FinalizerProcessor,
    epoch: Epoch,
    queue: Option<FinalizerQueue>,
    stats: SweepStats,
}

impl PendingFinalizers<'_> {
    /// Epoch of the sweep
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Number of objects to finalize
    pub fn len(&self) -> usize {
        self.queue.as_ref().map_or(0, Vec::len)
    }

    /// Nothing to finalize
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep counters
    pub fn stats(&self) -> SweepStats {
        self.stats
    }

    /// Hand the queue to the finalizer thread, closing out the epoch
    pub fn dispatch(mut self) {
        let Some(queue) = self.queue.take() else {
            unreachable!("PendingFinalizers dispatched twice");
        };
        self.processor.schedule_tasks(queue, self.epoch);
    }
}

impl Drop for PendingFinalizers<'_> {
    fn drop(&mut self) {
        if self.queue.is_some() && !std::thread::panicking() {
            panic!(
                "PendingFinalizers for epoch {} dropped without dispatch",
                self.epoch
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::TypeInfo;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    static NODE: TypeInfo = TypeInfo::object("Node", 16, 8, &[0]);

    fn allocator() -> (Allocator, Arc<AtomicU64>) {
        let finalized = Arc::new(AtomicU64::new(0));
        let f = finalized.clone();
        let allocator = Allocator::new(move |epoch| {
            f.store(epoch, Ordering::SeqCst);
        });
        (allocator, finalized)
    }

    fn mark(obj: ObjRef, epoch: Epoch) {
        obj.object_data().try_mark(epoch);
    }

    #[test]
    fn test_allocate_and_publish() {
        let (allocator, _) = allocator();
        let mut local = AllocatorThreadData::default();
        let (obj, total) = local.allocate(&allocator, &NODE, 0).unwrap();
        assert_eq!(total, obj.allocated_size());
        assert_eq!(allocator.allocated_bytes(), 48);
        assert_eq!(allocator.object_count(), 0);
        assert_eq!(local.pending_objects(), 1);

        local.publish(&allocator);
        assert_eq!(allocator.object_count(), 1);
        assert_eq!(local.pending_objects(), 0);
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let (allocator, finalized) = allocator();
        let mut local = AllocatorThreadData::default();
        let (live, _) = local.allocate(&allocator, &NODE, 0).unwrap();
        let (_dead, _) = local.allocate(&allocator, &NODE, 0).unwrap();
        local.publish(&allocator);

        let heap = allocator.prepare_for_gc(1);
        assert_eq!(heap.object_count(), 2);
        mark(live, 1);
        let pending = heap.sweep();
        assert!(pending.is_empty());
        assert_eq!(
            pending.stats(),
            SweepStats {
                kept_objects: 1,
                kept_bytes: 48,
                swept_objects: 1,
                swept_bytes: 48,
                ..SweepStats::default()
            }
        );
        pending.dispatch();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let mut seen = Vec::new();
        let heap = allocator.prepare_for_gc(2);
        heap.traverse_objects(|obj| seen.push(obj));
        mark(live, 2);
        heap.sweep().dispatch();
        assert_eq!(seen, vec![live]);
        assert_eq!(allocator.allocated_bytes(), 48);
    }

    #[test]
    fn test_unpublished_objects_survive() {
        let (allocator, _) = allocator();
        let mut local = AllocatorThreadData::default();
        local.allocate(&allocator, &NODE, 0).unwrap();

        allocator.prepare_for_gc(1).sweep().dispatch();
        assert_eq!(local.pending_objects(), 1);
        assert_eq!(allocator.allocated_bytes(), 48);
        local.clear_for_tests(&allocator);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_native_cleanup_runs_on_finalizer_thread() {
        let (allocator, finalized) = allocator();
        let mut local = AllocatorThreadData::default();
        let (obj, _) = local.allocate(&allocator, &NODE, 0).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        local
            .allocate_extra(obj)
            .set_associated_object(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        local.publish(&allocator);
        assert_eq!(allocator.extra_count(), 1);

        let pending = allocator.prepare_for_gc(1).sweep();
        assert_eq!(pending.len(), 1);
        pending.dispatch();

        let deadline = Instant::now() + Duration::from_secs(10);
        while finalized.load(Ordering::SeqCst) != 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(allocator.allocated_bytes(), 0);

        // The detached extra goes away with the next sweep
        let pending = allocator.prepare_for_gc(2).sweep();
        assert_eq!(pending.stats().swept_extras, 1);
        pending.dispatch();
        assert_eq!(allocator.extra_count(), 0);
    }

    #[test]
    fn test_extra_without_cleanup_is_freed_with_object() {
        let (allocator, _) = allocator();
        let mut local = AllocatorThreadData::default();
        let (obj, _) = local.allocate(&allocator, &NODE, 0).unwrap();
        let extra = local.allocate_extra(obj) as *const ExtraObjectData;
        assert_eq!(local.allocate_extra(obj) as *const _, extra);
        local.publish(&allocator);

        let pending = allocator.prepare_for_gc(1).sweep();
        assert!(pending.is_empty());
        assert_eq!(pending.stats().swept_objects, 1);
        assert_eq!(pending.stats().swept_extras, 1);
        pending.dispatch();
    }

    #[test]
    #[should_panic(expected = "is not newer")]
    fn test_prepare_requires_new_epoch() {
        let (allocator, _) = allocator();
        allocator.prepare_for_gc(2).sweep().dispatch();
        let _heap = allocator.prepare_for_gc(2);
    }

    #[test]
    #[should_panic(expected = "dropped without sweep")]
    fn test_marked_heap_must_be_swept() {
        let (allocator, _) = allocator();
        drop(allocator.prepare_for_gc(1));
    }

    #[test]
    #[should_panic(expected = "dropped without dispatch")]
    fn test_pending_finalizers_must_be_dispatched() {
        let (allocator, _) = allocator();
        drop(allocator.prepare_for_gc(1).sweep());
    }
}
