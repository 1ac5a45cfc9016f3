//! Root collection and marking
//!
//! Marking is a plain worklist traversal. Objects are stamped with the
//! current epoch when first reached, so each object is pushed at most once
//! and the traversal order does not matter.

use crate::gc_state::Epoch;
use crate::object::ObjRef;
use crate::roots::RootSet;
use crate::thread::ThreadRegistry;

/// Marking worklist
#[derive(Debug, Default)]
pub struct MarkQueue {
    stack: Vec<ObjRef>,
}

impl MarkQueue {
    /// Mark `obj` and queue it if it was not marked yet
    #[inline]
    pub fn push(&mut self, obj: ObjRef, epoch: Epoch) -> bool {
        if obj.object_data().try_mark(epoch) {
            self.stack.push(obj);
            true
        } else {
            false
        }
    }

    /// Queued objects
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Marking counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Distinct objects reached from roots directly
    pub roots: usize,
    /// Objects marked in total
    pub marked_objects: usize,
    /// Bytes of marked objects
    pub marked_bytes: usize,
}

/// Push every root of every registered thread and every global root.
/// Returns the number of distinct root objects.
pub fn collect_root_set(
    epoch: Epoch,
    threads: &ThreadRegistry,
    root_sets: &[&dyn RootSet],
    queue: &mut MarkQueue,
) -> usize {
    let mut roots = 0;
    let mut push = |obj: ObjRef| {
        if queue.push(obj, epoch) {
            roots += 1;
        }
    };
    let threads = threads.lock_for_iter();
    for root_set in root_sets {
        root_set.for_each_global_root(&mut push);
        for thread in threads.iter() {
            root_set.for_each_thread_root(thread, &mut push);
        }
    }
    roots
}

/// Drain the worklist, marking everything reachable
pub fn mark(epoch: Epoch, mut queue: MarkQueue, roots: usize) -> MarkStats {
    let mut stats = MarkStats {
        roots,
        ..MarkStats::default()
    };
    while let Some(obj) = queue.stack.pop() {
        stats.marked_objects += 1;
        stats.marked_bytes += obj.allocated_size();
        obj.for_each_ref(|child| {
            queue.push(child, epoch);
        });
    }
    stats
}
