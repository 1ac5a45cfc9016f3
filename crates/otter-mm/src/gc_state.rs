//! Epoch state machine shared by the scheduler, the collector and waiters.
//!
//! Each collection gets an epoch number. An epoch goes through
//! `scheduled -> started -> finished -> finalized`; all four counters are
//! monotonic. Scheduling while an epoch is already scheduled but not yet
//! started coalesces into that epoch.

use parking_lot::{Condvar, Mutex};

/// Collection cycle identifier; epoch 0 means "none yet"
pub type Epoch = u64;

#[derive(Debug, Default, Clone, Copy)]
struct Epochs {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    finalized: Epoch,
    shutdown: bool,
}

/// Holder of the four epoch counters
#[derive(Debug, Default)]
pub struct GcStateHolder {
    epochs: Mutex<Epochs>,
    cond: Condvar,
}

impl GcStateHolder {
    /// Create the holder with every counter at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a collection. Returns the epoch that will serve the request:
    /// the pending one if a collection is already scheduled but not started.
    pub fn schedule(&self) -> Epoch {
        let mut epochs = self.epochs.lock();
        if epochs.scheduled <= epochs.started {
            epochs.scheduled = epochs.started + 1;
            self.cond.notify_all();
        }
        epochs.scheduled
    }

    /// The collector started `epoch`
    pub fn start(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        assert!(
            epoch > epochs.started,
            "epoch {epoch} started after {}",
            epochs.started
        );
        epochs.started = epoch;
        self.cond.notify_all();
    }

    /// The collector finished `epoch` (mutators resumed, heap swept)
    pub fn finish(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        assert!(
            epoch == epochs.started,
            "epoch {epoch} finished while {} is started",
            epochs.started
        );
        epochs.finished = epoch;
        self.cond.notify_all();
    }

    /// Every finalizer of `epoch` has run
    pub fn finalized(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        if epoch > epochs.finalized {
            epochs.finalized = epoch;
        }
        self.cond.notify_all();
    }

    /// Wake every waiter; `wait_scheduled` returns `None` from now on
    pub fn shutdown(&self) {
        self.epochs.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Block until a new epoch is scheduled. `None` on shutdown.
    pub fn wait_scheduled(&self) -> Option<Epoch> {
        let mut epochs = self.epochs.lock();
        self.cond
            .wait_while(&mut epochs, |e| e.scheduled <= e.started && !e.shutdown);
        if epochs.shutdown {
            None
        } else {
            Some(epochs.scheduled)
        }
    }

    /// Block until `epoch` is finished (or the state is shut down)
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        self.cond
            .wait_while(&mut epochs, |e| e.finished < epoch && !e.shutdown);
    }

    /// Block until `epoch` is finalized (or the state is shut down)
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        let mut epochs = self.epochs.lock();
        self.cond
            .wait_while(&mut epochs, |e| e.finalized < epoch && !e.shutdown);
    }

    /// Last scheduled epoch
    pub fn scheduled(&self) -> Epoch {
        self.epochs.lock().scheduled
    }

    /// Last started epoch
    pub fn started(&self) -> Epoch {
        self.epochs.lock().started
    }

    /// Last finished epoch
    pub fn finished(&self) -> Epoch {
        self.epochs.lock().finished
    }

    /// Last finalized epoch
    pub fn finalized_epoch(&self) -> Epoch {
        self.epochs.lock().finalized
    }

    /// Has `shutdown` been called
    pub fn is_shutdown(&self) -> bool {
        self.epochs.lock().shutdown
    }
}
