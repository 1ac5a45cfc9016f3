//! Stop-the-world suspension
//!
//! The collector raises a global request flag and activates safepoints.
//! Runnable mutators publish their allocations and park at their next
//! safepoint; native mutators park when they try to become runnable again.
//! Once every registered thread is suspended or native the world is stopped.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};

use crate::safepoint::{SafePointActivator, SafePoints};
use crate::thread::{ThreadData, ThreadRegistry};

/// Global suspension request
#[derive(Debug, Default)]
pub struct ThreadSuspension {
    requested: CachePadded<AtomicBool>,
    lock: Mutex<()>,
    cond: Condvar,
    activator: Mutex<Option<SafePointActivator>>,
}

impl ThreadSuspension {
    /// Ask every mutator to suspend. Returns false if a request is already
    /// pending.
    pub fn request_threads_suspension(&self, safepoints: &SafePoints) -> bool {
        let _guard = self.lock.lock();
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.activator.lock() = Some(safepoints.activate());
        true
    }

    /// Is a suspension pending
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Spin until every registered thread is suspended or native
    pub fn wait_for_threads_suspension(&self, registry: &ThreadRegistry) {
        let backoff = Backoff::new();
        loop {
            let all_stopped = registry
                .lock_for_iter()
                .iter()
                .all(|t| t.is_suspended_or_native());
            if all_stopped {
                return;
            }
            backoff.snooze();
            if backoff.is_completed() {
                std::thread::yield_now();
            }
        }
    }

    /// Clear the request and wake every suspended thread
    pub fn resume_threads(&self) {
        let _guard = self.lock.lock();
        self.requested.store(false, Ordering::SeqCst);
        *self.activator.lock() = None;
        self.cond.notify_all();
    }

    /// Park `thread` until the pending request (if any) is cleared.
    ///
    /// Does not publish; callers on the safepoint path publish first.
    pub(crate) fn suspend_if_requested(&self, thread: &ThreadData) {
        if !self.is_requested() {
            return;
        }
        let mut guard = self.lock.lock();
        if !self.requested.load(Ordering::SeqCst) {
            return;
        }
        thread.set_suspended(true);
        tracing::trace!(target: "otter::gc", thread = thread.id(), "suspended");
        self.cond
            .wait_while(&mut guard, |_| self.requested.load(Ordering::SeqCst));
        thread.set_suspended(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadState;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_request_is_exclusive() {
        let safepoints = SafePoints::new();
        let suspension = ThreadSuspension::default();
        assert!(suspension.request_threads_suspension(&safepoints));
        assert!(!suspension.request_threads_suspension(&safepoints));
        assert!(safepoints.is_active());

        suspension.resume_threads();
        assert!(!suspension.is_requested());
        assert!(!safepoints.is_active());
    }

    #[test]
    fn test_suspend_and_resume() {
        let safepoints = SafePoints::new();
        let suspension = Arc::new(ThreadSuspension::default());
        let registry = Arc::new(ThreadRegistry::new());
        let thread = registry.register("worker");
        thread.leave_native(&suspension);
        let passes = Arc::new(AtomicUsize::new(0));

        assert!(suspension.request_threads_suspension(&safepoints));
        let worker = {
            let suspension = suspension.clone();
            let thread = thread.clone();
            let passes = passes.clone();
            std::thread::spawn(move || {
                suspension.suspend_if_requested(&thread);
                passes.fetch_add(1, Ordering::SeqCst);
            })
        };

        suspension.wait_for_threads_suspension(&registry);
        assert!(thread.is_suspended());
        assert_eq!(passes.load(Ordering::SeqCst), 0);

        suspension.resume_threads();
        worker.join().unwrap();
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert!(!thread.is_suspended());
        assert_eq!(thread.state(), ThreadState::Runnable);
    }

    #[test]
    fn test_native_threads_count_as_stopped() {
        let safepoints = SafePoints::new();
        let suspension = ThreadSuspension::default();
        let registry = ThreadRegistry::new();
        let _thread = registry.register("native");

        assert!(suspension.request_threads_suspension(&safepoints));
        suspension.wait_for_threads_suspension(&registry);
        suspension.resume_threads();
    }
}
