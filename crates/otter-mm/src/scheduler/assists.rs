//! Mutator assists
//!
//! When the heap crosses its hard boundary the scheduler requests assists for
//! the epoch it just scheduled. Until that epoch completes, every mutator
//! that reaches a safepoint parks (in the native state, so the collector can
//! proceed without it). Requests nest: safepoints stay active until the
//! newest requested epoch completes.
//!
//! Each thread records its progress in one word: `epoch * 2 + completed`.
//! `complete_epoch` waits for every registered thread to either be waiting
//! for a later epoch or to have set the completed bit, so no mutator is left
//! parked behind a finished epoch.
//!
//! Once the runtime shuts down no epoch will complete again: parked mutators
//! are released and further requests are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::gc_state::Epoch;
use crate::safepoint::{SafePointActivator, SafePointCounter};
use crate::thread::ThreadRegistry;

/// Per-thread assist progress
#[derive(Debug)]
pub struct AssistsThreadData {
    started_waiting: AtomicU64,
}

impl Default for AssistsThreadData {
    fn default() -> Self {
        // epoch 0, completed
        Self {
            started_waiting: AtomicU64::new(1),
        }
    }
}

impl AssistsThreadData {
    /// Has this thread observed the completion of `epoch`
    pub fn completed_epoch(&self, epoch: Epoch) -> bool {
        let value = self.started_waiting.load(Ordering::Acquire);
        let waiting_epoch = value / 2;
        let completed = value % 2 == 1;
        waiting_epoch > epoch || completed
    }
}

#[derive(Debug, Default)]
struct State {
    completed: Epoch,
    activator: Option<SafePointActivator>,
    shutdown: bool,
}

/// Global assist state
#[derive(Debug)]
pub struct MutatorAssists {
    assists_epoch: CachePadded<AtomicU64>,
    completed_epoch: CachePadded<AtomicU64>,
    shutdown: AtomicBool,
    state: Mutex<State>,
    cond: Condvar,
    safepoints: SafePointCounter,
}

impl MutatorAssists {
    /// Assists that activate safepoints through `safepoints`
    pub fn new(safepoints: SafePointCounter) -> Self {
        Self {
            assists_epoch: CachePadded::new(AtomicU64::new(0)),
            completed_epoch: CachePadded::new(AtomicU64::new(0)),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            safepoints,
        }
    }

    /// Make mutators assist until `epoch` completes. Requests for completed
    /// epochs are ignored.
    pub fn request_assists(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        if epoch <= state.completed || state.shutdown {
            return;
        }
        self.assists_epoch.fetch_max(epoch, Ordering::AcqRel);
        if state.activator.is_none() {
            tracing::debug!(target: "otter::gc", epoch, "mutator assists requested");
            state.activator = Some(self.safepoints.activate());
        }
    }

    /// Mark `epoch` completed, release parked mutators and wait until every
    /// registered thread has observed it.
    ///
    /// # Panics
    /// If `epoch` is not exactly one past the previously completed epoch.
    pub fn complete_epoch(&self, epoch: Epoch, registry: &ThreadRegistry) {
        {
            let mut state = self.state.lock();
            assert_eq!(
                epoch,
                state.completed + 1,
                "complete_epoch: epoch {epoch} after {}",
                state.completed
            );
            state.completed = epoch;
            self.completed_epoch.store(epoch, Ordering::Release);
            if self.assists_epoch.load(Ordering::Acquire) <= epoch {
                state.activator = None;
            }
            self.cond.notify_all();
        }
        registry.wait_all_threads(|thread| thread.assists.completed_epoch(epoch));
    }

    /// Release every parked mutator and ignore later requests. Epochs the
    /// collector is still finishing may complete afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.activator = None;
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Are assists still outstanding
    pub fn is_active(&self) -> bool {
        self.state.lock().activator.is_some()
    }

    /// Epoch mutators currently have to assist for, if any
    pub fn pending_epoch(&self) -> Option<Epoch> {
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let epoch = self.assists_epoch.load(Ordering::Acquire);
        if epoch > self.completed_epoch.load(Ordering::Acquire) {
            Some(epoch)
        } else {
            None
        }
    }

    /// Park the calling mutator until `epoch` completes or assists shut down.
    ///
    /// `park` switches the thread to the native state, runs the wait closure
    /// it is given, and switches back. The completed bit is set inside the
    /// wait, before the thread leaves the native state.
    pub fn safe_point(
        &self,
        thread: &AssistsThreadData,
        epoch: Epoch,
        park: impl FnOnce(&mut dyn FnMut()),
    ) {
        thread.started_waiting.store(epoch * 2, Ordering::Release);
        let mut wait = || {
            let mut state = self.state.lock();
            self.cond
                .wait_while(&mut state, |state| state.completed < epoch && !state.shutdown);
            drop(state);
            thread
                .started_waiting
                .store(epoch * 2 + 1, Ordering::Release);
        };
        park(&mut wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafePoints;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_nesting() {
        let safepoints = SafePoints::new();
        let registry = ThreadRegistry::new();
        let assists = MutatorAssists::new(safepoints.counter().clone());

        assists.request_assists(1);
        assists.request_assists(2);
        assert!(safepoints.is_active());
        assert_eq!(assists.pending_epoch(), Some(2));

        assists.complete_epoch(1, &registry);
        assert!(assists.is_active());
        assert!(safepoints.is_active());

        assists.complete_epoch(2, &registry);
        assert!(!assists.is_active());
        assert!(!safepoints.is_active());
        assert_eq!(assists.pending_epoch(), None);
    }

    #[test]
    fn test_request_for_completed_epoch_is_ignored() {
        let safepoints = SafePoints::new();
        let registry = ThreadRegistry::new();
        let assists = MutatorAssists::new(safepoints.counter().clone());
        assists.complete_epoch(1, &registry);

        assists.request_assists(1);
        assert!(!safepoints.is_active());
        assists.request_assists(2);
        assert!(safepoints.is_active());
        assists.complete_epoch(2, &registry);
        assert!(!safepoints.is_active());
    }

    #[test]
    #[should_panic(expected = "complete_epoch: epoch 3 after 1")]
    fn test_complete_must_be_sequential() {
        let registry = ThreadRegistry::new();
        let assists = MutatorAssists::new(SafePointCounter::default());
        assists.complete_epoch(1, &registry);
        assists.complete_epoch(3, &registry);
    }

    #[test]
    fn test_parked_mutator_released_on_completion() {
        let safepoints = SafePoints::new();
        let registry = Arc::new(ThreadRegistry::new());
        let assists = Arc::new(MutatorAssists::new(safepoints.counter().clone()));
        let thread = registry.register("mutator");
        assert!(thread.assists.completed_epoch(0));

        assists.request_assists(1);
        let epoch = assists.pending_epoch().unwrap();
        let parked = {
            let assists = assists.clone();
            let thread = thread.clone();
            std::thread::spawn(move || {
                assists.safe_point(&thread.assists, epoch, |wait| wait());
            })
        };

        // Give the mutator a chance to park, then complete
        std::thread::sleep(Duration::from_millis(20));
        assists.complete_epoch(1, &registry);
        assert!(thread.assists.completed_epoch(1));
        parked.join().unwrap();
        assert!(!safepoints.is_active());
    }

    #[test]
    fn test_shutdown_releases_parked_mutator() {
        let safepoints = SafePoints::new();
        let registry = Arc::new(ThreadRegistry::new());
        let assists = Arc::new(MutatorAssists::new(safepoints.counter().clone()));
        let thread = registry.register("mutator");

        assists.request_assists(1);
        let parked = {
            let assists = assists.clone();
            let thread = thread.clone();
            std::thread::spawn(move || {
                assists.safe_point(&thread.assists, 1, |wait| wait());
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assists.shutdown();
        parked.join().unwrap();
        assert!(!safepoints.is_active());
        assert_eq!(assists.pending_epoch(), None);

        // Nothing will complete epoch 2, so it is never requested
        assists.request_assists(2);
        assert!(!safepoints.is_active());
        assert_eq!(assists.pending_epoch(), None);

        // A collection still in flight can complete its epoch
        assists.complete_epoch(1, &registry);
    }
}
