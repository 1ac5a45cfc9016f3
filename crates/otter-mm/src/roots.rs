//! Root set
//!
//! The built-in [`RootRegistry`] covers global roots ([`StableRef`]s) and
//! each mutator's local root stack. Embedders with their own notion of roots
//! (interpreter stacks, handle scopes) plug in a [`RootSet`] implementation
//! which is consulted in addition to the registry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::object::ObjRef;
use crate::thread::ThreadData;

/// Root enumeration collaborator
pub trait RootSet: Send + Sync {
    /// Visit roots that do not belong to any thread
    fn for_each_global_root(&self, f: &mut dyn FnMut(ObjRef));

    /// Visit roots owned by `thread`
    fn for_each_thread_root(&self, thread: &ThreadData, f: &mut dyn FnMut(ObjRef));
}

type Globals = Arc<Mutex<FxHashMap<u64, ObjRef>>>;

/// Global roots and per-thread local roots
#[derive(Debug, Default)]
pub struct RootRegistry {
    globals: Globals,
    next_id: AtomicU64,
}

impl RootRegistry {
    /// Root `obj` until the returned handle is dropped
    pub fn create_stable_ref(&self, obj: ObjRef) -> StableRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.globals.lock().insert(id, obj);
        StableRef {
            id,
            obj,
            globals: self.globals.clone(),
        }
    }

    /// Number of live stable references
    pub fn stable_ref_count(&self) -> usize {
        self.globals.lock().len()
    }
}

impl RootSet for RootRegistry {
    fn for_each_global_root(&self, f: &mut dyn FnMut(ObjRef)) {
        for &obj in self.globals.lock().values() {
            f(obj);
        }
    }

    fn for_each_thread_root(&self, thread: &ThreadData, f: &mut dyn FnMut(ObjRef)) {
        thread.for_each_local_root(f);
    }
}

/// Global root handle; the object stays alive while the handle exists
pub struct StableRef {
    id: u64,
    obj: ObjRef,
    globals: Globals,
}

impl StableRef {
    /// The rooted object
    pub fn get(&self) -> ObjRef {
        self.obj
    }
}

impl fmt::Debug for StableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StableRef")
            .field("id", &self.id)
            .field("obj", &self.obj)
            .finish()
    }
}

impl Drop for StableRef {
    fn drop(&mut self) {
        self.globals.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TypeInfo, allocate_instance, deallocate_instance};

    static LEAF: TypeInfo = TypeInfo::object("Leaf", 8, 8, &[]);

    #[test]
    fn test_stable_refs() {
        let registry = RootRegistry::default();
        let obj = allocate_instance(&LEAF, 0).unwrap();

        let a = registry.create_stable_ref(obj);
        let b = registry.create_stable_ref(obj);
        assert_eq!(a.get(), obj);
        assert_eq!(registry.stable_ref_count(), 2);

        let mut roots = Vec::new();
        registry.for_each_global_root(&mut |r| roots.push(r));
        assert_eq!(roots, vec![obj, obj]);

        drop(a);
        assert_eq!(registry.stable_ref_count(), 1);
        drop(b);
        assert_eq!(registry.stable_ref_count(), 0);

        unsafe { deallocate_instance(obj) }
    }
}
