//! Weak references
//!
//! An object has at most one [`WeakSlot`], hung off its extra data, shared by
//! every [`WeakRef`] to it. The collector clears slots whose referent is
//! unmarked after marking and before sweeping; reads go through the
//! barrier so a slot that is about to be cleared already reads as empty.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::barrier::Barriers;
use crate::gc_state::Epoch;
use crate::object::{ObjHeader, ObjRef};

/// Shared referent cell
#[derive(Debug)]
pub struct WeakSlot {
    referent: AtomicPtr<ObjHeader>,
}

impl WeakSlot {
    pub(crate) fn new(referent: ObjRef) -> Self {
        Self {
            referent: AtomicPtr::new(referent.as_ptr()),
        }
    }

    /// Raw referent, without the barrier
    pub(crate) fn load(&self) -> Option<ObjRef> {
        NonNull::new(self.referent.load(Ordering::Acquire))
            // SAFETY: the slot is cleared before its referent is swept
            .map(|ptr| unsafe { ObjRef::from_raw(ptr) })
    }

    /// Clear the slot if the referent is unmarked. Returns true if cleared.
    fn clear_if_unmarked(&self, epoch: Epoch) -> bool {
        match self.load() {
            Some(obj) if !obj.is_marked_in(epoch) => self
                .referent
                .compare_exchange(
                    obj.as_ptr(),
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            _ => false,
        }
    }
}

/// Handle to a weakly referenced object
#[derive(Clone)]
pub struct WeakRef {
    slot: Arc<WeakSlot>,
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakRef")
            .field(&self.slot.referent.load(Ordering::Relaxed))
            .finish()
    }
}

impl WeakRef {
    pub(crate) fn new(slot: Arc<WeakSlot>) -> Self {
        Self { slot }
    }

    pub(crate) fn read(&self, barriers: &Barriers) -> Option<ObjRef> {
        barriers.weak_ref_read(self.slot.load())
    }

    /// Has the collector cleared this reference
    pub fn is_cleared(&self) -> bool {
        self.slot.referent.load(Ordering::Acquire).is_null()
    }

    /// Do both handles refer to the same slot
    pub fn ptr_eq(&self, other: &WeakRef) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

/// Every weak slot the collector must process
#[derive(Debug, Default)]
pub struct WeakRefRegistry {
    slots: Mutex<Vec<Weak<WeakSlot>>>,
}

impl WeakRefRegistry {
    pub(crate) fn register(&self, slot: &Arc<WeakSlot>) {
        self.slots.lock().push(Arc::downgrade(slot));
    }

    /// Live slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// No live slots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear slots of unmarked referents and forget dropped slots.
    /// Returns the number of cleared slots.
    pub fn process_weaks(&self, epoch: Epoch) -> usize {
        let mut cleared = 0;
        self.slots.lock().retain(|slot| match slot.upgrade() {
            Some(slot) => {
                if slot.clear_if_unmarked(epoch) {
                    cleared += 1;
                }
                true
            }
            None => false,
        });
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TypeInfo, allocate_instance, deallocate_instance};

    static LEAF: TypeInfo = TypeInfo::object("Leaf", 8, 8, &[]);

    #[test]
    fn test_process_weaks() {
        let registry = WeakRefRegistry::default();
        let barriers = Barriers::default();
        let live = allocate_instance(&LEAF, 0).unwrap();
        let dead = allocate_instance(&LEAF, 0).unwrap();

        let live_slot = Arc::new(WeakSlot::new(live));
        let dead_slot = Arc::new(WeakSlot::new(dead));
        registry.register(&live_slot);
        registry.register(&dead_slot);
        let live_ref = WeakRef::new(live_slot);
        let dead_ref = WeakRef::new(dead_slot);

        live.object_data().try_mark(1);
        assert_eq!(registry.process_weaks(1), 1);
        assert_eq!(live_ref.read(&barriers), Some(live));
        assert_eq!(dead_ref.read(&barriers), None);
        assert!(dead_ref.is_cleared());

        // Dropped handles are pruned
        drop(dead_ref);
        assert_eq!(registry.process_weaks(1), 0);
        assert_eq!(registry.len(), 1);

        unsafe {
            deallocate_instance(live);
            deallocate_instance(dead);
        }
    }

    #[test]
    fn test_clones_share_slot() {
        let obj = allocate_instance(&LEAF, 0).unwrap();
        let a = WeakRef::new(Arc::new(WeakSlot::new(obj)));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        unsafe { deallocate_instance(obj) }
    }
}
