//! Safepoint polling
//!
//! Mutators poll [`SafePoints::is_active`] pervasively; while nothing is
//! pending this is a single relaxed load of a cache-padded counter. Every
//! party that needs mutators to run the slow path (suspension requests,
//! assists, weak-reference checkpoints, the aggressive scheduler, a
//! registered action) holds a [`SafePointActivator`] for as long as it does.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::thread::ThreadData;

/// Action run by every mutator on the safepoint slow path
pub type SafePointAction = fn(&ThreadData);

/// Shared count of active safepoint requests
#[derive(Debug, Clone, Default)]
pub struct SafePointCounter {
    active: Arc<CachePadded<AtomicI64>>,
}

impl SafePointCounter {
    /// Hot path check
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) > 0
    }

    /// Slow path re-check with acquire ordering
    pub fn is_active_acquire(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Activate safepoints until the returned value is dropped
    pub fn activate(&self) -> SafePointActivator {
        self.active.fetch_add(1, Ordering::AcqRel);
        SafePointActivator {
            active: self.active.clone(),
        }
    }
}

/// Keeps the safepoint slow path enabled while alive
#[derive(Debug)]
#[must_use = "safepoints are deactivated when the activator is dropped"]
pub struct SafePointActivator {
    active: Arc<CachePadded<AtomicI64>>,
}

impl Drop for SafePointActivator {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced safepoint activator");
    }
}

/// Safepoint state of a runtime
#[derive(Debug, Default)]
pub struct SafePoints {
    counter: SafePointCounter,
    action: AtomicPtr<()>,
    action_activator: Mutex<Option<SafePointActivator>>,
}

impl SafePoints {
    /// Create with nothing active
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared counter
    pub fn counter(&self) -> &SafePointCounter {
        &self.counter
    }

    /// Hot path check
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.counter.is_active()
    }

    /// Activate safepoints until the returned value is dropped
    pub fn activate(&self) -> SafePointActivator {
        self.counter.activate()
    }

    /// Register `action`. Fails if another action is registered.
    pub fn try_set_action(&self, action: SafePointAction) -> bool {
        let mut activator = self.action_activator.lock();
        let installed = self
            .action
            .compare_exchange(
                std::ptr::null_mut(),
                action as *mut (),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if installed {
            *activator = Some(self.counter.activate());
        }
        installed
    }

    /// Unregister the current action.
    ///
    /// # Panics
    /// If no action is registered.
    pub fn unset_action(&self) {
        let mut activator = self.action_activator.lock();
        let prev = self.action.swap(std::ptr::null_mut(), Ordering::AcqRel);
        assert!(!prev.is_null(), "no safepoint action is registered");
        *activator = None;
    }

    /// Currently registered action
    pub fn action(&self) -> Option<SafePointAction> {
        let ptr = self.action.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: only ever stored from a `SafePointAction` in try_set_action
            Some(unsafe { std::mem::transmute::<*mut (), SafePointAction>(ptr) })
        }
    }
}

thread_local! {
    static IN_SAFE_POINT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running the safepoint slow path
pub(crate) struct RecursionGuard(());

impl RecursionGuard {
    /// `None` if the slow path is already running on this thread
    pub(crate) fn enter() -> Option<Self> {
        IN_SAFE_POINT.with(|flag| {
            if flag.replace(true) {
                None
            } else {
                Some(Self(()))
            }
        })
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        IN_SAFE_POINT.with(|flag| flag.set(false));
    }
}
