//! Finalizer thread.
//!
//! Swept objects that still own a native cleanup are handed over in a
//! [`FinalizerQueue`] and processed FIFO on a dedicated thread, off the
//! collection critical path. Once a batch is drained the epoch it belongs to
//! is reported through the `epoch_done` callback, which is what
//! `schedule_and_wait_finalized` waits on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::gc_state::Epoch;
use crate::object::ObjRef;

/// Objects of one epoch waiting for finalization
pub type FinalizerQueue = Vec<ObjRef>;

type FinalizeFn = Box<dyn Fn(ObjRef) + Send + Sync>;
type EpochDoneFn = Box<dyn Fn(Epoch) + Send + Sync>;

#[derive(Default)]
struct State {
    queue: VecDeque<ObjRef>,
    epoch: Option<Epoch>,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    finalize: FinalizeFn,
    epoch_done: EpochDoneFn,
}

/// Owner of the finalizer thread
pub struct FinalizerProcessor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FinalizerProcessor {
    /// Create a processor; no thread is started yet
    pub fn new(
        finalize: impl Fn(ObjRef) + Send + Sync + 'static,
        epoch_done: impl Fn(Epoch) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
                finalize: Box::new(finalize),
                epoch_done: Box::new(epoch_done),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Queue `tasks` for `epoch`.
    ///
    /// With nothing to do and no thread running, the epoch is reported done
    /// immediately on the calling thread.
    pub fn schedule_tasks(&self, tasks: FinalizerQueue, epoch: Epoch) {
        let mut thread = self.thread.lock();
        if tasks.is_empty() && thread.is_none() {
            drop(thread);
            (self.shared.epoch_done)(epoch);
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.queue.extend(tasks);
            state.epoch = Some(epoch);
        }
        if thread.is_none() {
            *thread = Some(self.spawn());
        }
        self.shared.cond.notify_all();
    }

    /// Start the thread unless it is already running
    pub fn start_finalizer_thread_if_needed(&self) {
        let mut thread = self.thread.lock();
        if thread.is_none() {
            *thread = Some(self.spawn());
        }
    }

    /// Drain the queue and stop the thread, if running
    pub fn stop_finalizer_thread_if_running(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };
        self.shared.state.lock().stop = true;
        self.shared.cond.notify_all();
        if handle.join().is_err() {
            tracing::error!(target: "otter::gc", "finalizer thread panicked");
        }
        self.shared.state.lock().stop = false;
    }

    /// Is the finalizer thread running
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Objects queued but not yet finalized
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn spawn(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("otter-finalizer".into())
            .spawn(move || finalizer_loop(&shared));
        match spawned {
            Ok(handle) => handle,
            Err(e) => panic!("failed to start the finalizer thread: {e}"),
        }
    }
}

impl Drop for FinalizerProcessor {
    fn drop(&mut self) {
        self.stop_finalizer_thread_if_running();
    }
}

fn finalizer_loop(shared: &Shared) {
    tracing::debug!(target: "otter::gc", "finalizer thread started");
    loop {
        let mut state = shared.state.lock();
        shared
            .cond
            .wait_while(&mut state, |s| s.queue.is_empty() && s.epoch.is_none() && !s.stop);
        if state.queue.is_empty() && state.epoch.is_none() {
            break;
        }
        let batch: Vec<ObjRef> = state.queue.drain(..).collect();
        let epoch = state.epoch.take();
        drop(state);

        for obj in &batch {
            (shared.finalize)(*obj);
        }
        if let Some(epoch) = epoch {
            tracing::debug!(
                target: "otter::gc",
                epoch,
                finalized = batch.len(),
                "finalizers done"
            );
            (shared.epoch_done)(epoch);
        }
    }
    tracing::debug!(target: "otter::gc", "finalizer thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TypeInfo, allocate_instance, deallocate_instance};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    static CELL: TypeInfo = TypeInfo::object("Cell", 8, 8, &[]);

    struct Counters {
        finalized: Arc<AtomicUsize>,
        done: Arc<AtomicU64>,
    }

    fn processor() -> (FinalizerProcessor, Counters) {
        let finalized = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicU64::new(0));
        let f = finalized.clone();
        let d = done.clone();
        let processor = FinalizerProcessor::new(
            move |obj| {
                f.fetch_add(1, Ordering::SeqCst);
                unsafe { deallocate_instance(obj) }
            },
            move |epoch| {
                d.fetch_max(epoch, Ordering::SeqCst);
            },
        );
        (processor, Counters { finalized, done })
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn objects(n: usize) -> FinalizerQueue {
        (0..n).map(|_| allocate_instance(&CELL, 0).unwrap()).collect()
    }

    #[test]
    fn test_empty_queue_completes_inline() {
        let (processor, counters) = processor();
        processor.schedule_tasks(Vec::new(), 1);
        assert_eq!(counters.done.load(Ordering::SeqCst), 1);
        assert!(!processor.is_running());
    }

    #[test]
    fn test_tasks_start_thread() {
        let (processor, counters) = processor();
        processor.schedule_tasks(objects(5), 1);
        assert!(processor.is_running());
        wait_for(|| counters.done.load(Ordering::SeqCst) == 1);
        assert_eq!(counters.finalized.load(Ordering::SeqCst), 5);

        // Once running, empty epochs still go through the thread
        processor.schedule_tasks(Vec::new(), 2);
        wait_for(|| counters.done.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (processor, counters) = processor();
        processor.stop_finalizer_thread_if_running();
        processor.start_finalizer_thread_if_needed();
        processor.start_finalizer_thread_if_needed();
        assert!(processor.is_running());

        processor.schedule_tasks(objects(3), 1);
        processor.stop_finalizer_thread_if_running();
        processor.stop_finalizer_thread_if_running();
        assert!(!processor.is_running());
        // Stopping drains what was queued
        assert_eq!(counters.finalized.load(Ordering::SeqCst), 3);
        assert_eq!(counters.done.load(Ordering::SeqCst), 1);

        // Restart works
        processor.schedule_tasks(objects(2), 2);
        wait_for(|| counters.done.load(Ordering::SeqCst) == 2);
        assert_eq!(counters.finalized.load(Ordering::SeqCst), 5);
    }
}
