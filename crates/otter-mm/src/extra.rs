//! Side metadata attached to heap objects.
//!
//! Most objects never need an [`ExtraObjectData`]. Objects that carry a
//! native cleanup hook or that are targets of a [`WeakRef`](crate::WeakRef)
//! get one lazily; it is installed into the header with a CAS, so at most one
//! is ever attached to an object.
//!
//! Lifecycle during collection:
//! - base object dead, no native cleanup: marked `FINALIZED`, the object is
//!   freed directly by the sweep and the extra becomes `SWEEPABLE`;
//! - base object dead, with native cleanup: the object goes to the finalizer
//!   queue; the finalizer thread runs the cleanup, sets `FINALIZED` then
//!   `SWEEPABLE` and detaches it;
//! - `SWEEPABLE` extras are freed by the next sweep.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::object::{ObjHeader, ObjRef};
use crate::weak_ref::WeakSlot;

/// Native cleanup run on the finalizer thread after the object dies
pub type NativeCleanup = Box<dyn FnOnce() + Send>;

/// Extra data flags (monotonic: flags are only ever set)
pub mod flags {
    /// Finalization is done (or not needed); the object may be freed
    pub const FINALIZED: u32 = 1 << 0;
    /// The extra itself may be freed by the next sweep
    pub const SWEEPABLE: u32 = 1 << 1;
}

/// Per-object side metadata
pub struct ExtraObjectData {
    flags: AtomicU32,
    base: AtomicPtr<ObjHeader>,
    associated: Mutex<Option<NativeCleanup>>,
    weak: OnceLock<Arc<WeakSlot>>,
}

impl fmt::Debug for ExtraObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraObjectData")
            .field("flags", &self.flags())
            .field("base", &self.base.load(Ordering::Relaxed))
            .field("has_associated", &self.has_associated_object())
            .finish()
    }
}

impl ExtraObjectData {
    pub(crate) fn new(base: ObjRef) -> Self {
        Self {
            flags: AtomicU32::new(0),
            base: AtomicPtr::new(base.as_ptr()),
            associated: Mutex::new(None),
            weak: OnceLock::new(),
        }
    }

    /// Current flag bits
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Is `flag` set
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    /// Object this extra is attached to, `None` once detached
    pub fn base_object(&self) -> Option<ObjRef> {
        NonNull::new(self.base.load(Ordering::Acquire))
            // SAFETY: the base pointer is only ever set from a live ObjRef
            .map(|ptr| unsafe { ObjRef::from_raw(ptr) })
    }

    /// Attach a native cleanup, replacing (and dropping unrun) any earlier one
    pub(crate) fn set_associated_object(&self, cleanup: NativeCleanup) {
        *self.associated.lock() = Some(cleanup);
    }

    /// Is a native cleanup attached
    pub fn has_associated_object(&self) -> bool {
        self.associated.lock().is_some()
    }

    pub(crate) fn take_associated_object(&self) -> Option<NativeCleanup> {
        self.associated.lock().take()
    }

    /// Weak slot for the base object, created on first use
    pub(crate) fn weak_slot_or_init(&self, init: impl FnOnce() -> Arc<WeakSlot>) -> Arc<WeakSlot> {
        self.weak.get_or_init(init).clone()
    }

    /// Break the link between the extra and its base object
    pub(crate) fn detach(&self) {
        if let Some(base) = self.base_object() {
            base.clear_extra();
        }
        self.base
            .store(std::ptr::null_mut(), Ordering::Release);
    }
}

/// Owning pointer to a heap-allocated [`ExtraObjectData`], as kept in stores
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ExtraRef(NonNull<ExtraObjectData>);

// SAFETY: ExtraObjectData is Sync; the pointer is owned by exactly one store
unsafe impl Send for ExtraRef {}
unsafe impl Sync for ExtraRef {}

impl ExtraRef {
    pub(crate) fn new(extra: ExtraObjectData) -> Self {
        Self(NonNull::from(Box::leak(Box::new(extra))))
    }

    pub(crate) fn as_non_null(self) -> NonNull<ExtraObjectData> {
        self.0
    }

    pub(crate) fn get(&self) -> &ExtraObjectData {
        // SAFETY: alive until `destroy`
        unsafe { self.0.as_ref() }
    }

    /// Free the extra.
    ///
    /// # Safety
    /// The extra must be unreachable from any object header and store.
    pub(crate) unsafe fn destroy(self) {
        // SAFETY: created by Box::leak in `new`
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// Extra data of `obj`, if one is installed
pub(crate) fn extra_of(obj: ObjRef) -> Option<&'static ExtraObjectData> {
    // SAFETY: extras outlive the header link; they are detached before being freed
    NonNull::new(obj.extra_ptr()).map(|ptr| unsafe { &*ptr.as_ptr() })
}
