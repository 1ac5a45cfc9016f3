//! Mutator thread registry
//!
//! Every attached mutator has a shared [`ThreadData`] registered in the
//! runtime's [`ThreadRegistry`]. The collector reads it to decide whether a
//! thread is stopped (suspended, or running native code that cannot touch
//! the managed heap), to collect the thread's roots, and to wait for
//! per-thread acknowledgements.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard};

use crate::barrier::BarriersThreadData;
use crate::object::ObjRef;
use crate::scheduler::assists::AssistsThreadData;
use crate::suspension::ThreadSuspension;

/// Execution state of a mutator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Running managed code; must reach a safepoint to be stopped
    Runnable = 0,
    /// Running native code; does not touch the managed heap
    Native = 1,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Runnable,
            _ => ThreadState::Native,
        }
    }
}

/// Shared per-thread state
#[derive(Debug)]
pub struct ThreadData {
    id: u64,
    name: String,
    state: AtomicU8,
    suspended: AtomicBool,
    pub(crate) assists: AssistsThreadData,
    pub(crate) barriers: BarriersThreadData,
    local_roots: Mutex<Vec<ObjRef>>,
}

impl ThreadData {
    fn new(id: u64, name: String) -> Self {
        Self {
            id,
            name,
            // Threads are born native and enter the runnable state on attach
            state: AtomicU8::new(ThreadState::Native as u8),
            suspended: AtomicBool::new(false),
            assists: AssistsThreadData::default(),
            barriers: BarriersThreadData::default(),
            local_roots: Mutex::new(Vec::new()),
        }
    }

    /// Registry-unique thread id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread name given on attach
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::SeqCst))
    }

    /// Is the thread parked at a suspension point
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Is the thread guaranteed not to touch the managed heap right now
    pub fn is_suspended_or_native(&self) -> bool {
        self.is_suspended() || self.state() == ThreadState::Native
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    /// Switch to native. The caller publishes its allocations first.
    pub(crate) fn enter_native(&self) {
        let prev = self.state.swap(ThreadState::Native as u8, Ordering::SeqCst);
        debug_assert_eq!(ThreadState::from(prev), ThreadState::Runnable);
    }

    /// Switch back to runnable, suspending first if the collector asked for it
    pub(crate) fn leave_native(&self, suspension: &ThreadSuspension) {
        // Pairs with the SeqCst request store in ThreadSuspension: either the
        // collector sees us runnable, or we see its request.
        let prev = self
            .state
            .swap(ThreadState::Runnable as u8, Ordering::SeqCst);
        debug_assert_eq!(ThreadState::from(prev), ThreadState::Native);
        suspension.suspend_if_requested(self);
    }

    pub(crate) fn push_local_root(&self, obj: ObjRef) {
        self.local_roots.lock().push(obj);
    }

    pub(crate) fn pop_local_root(&self) -> Option<ObjRef> {
        self.local_roots.lock().pop()
    }

    /// Number of local roots
    pub fn local_root_count(&self) -> usize {
        self.local_roots.lock().len()
    }

    /// Visit the thread's local roots
    pub fn for_each_local_root(&self, mut f: impl FnMut(ObjRef)) {
        for &obj in self.local_roots.lock().iter() {
            f(obj);
        }
    }
}

/// Registry of attached mutators
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadData>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, name: impl Into<String>) -> Arc<ThreadData> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let thread = Arc::new(ThreadData::new(id, name.into()));
        self.threads.lock().push(thread.clone());
        thread
    }

    pub(crate) fn unregister(&self, thread: &ThreadData) {
        self.threads
            .lock()
            .retain(|t| !std::ptr::eq(Arc::as_ptr(t), thread));
    }

    /// Lock against registration changes while iterating
    pub fn lock_for_iter(&self) -> MutexGuard<'_, Vec<Arc<ThreadData>>> {
        self.threads.lock()
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// No registered threads
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spin until `pred` holds for every registered thread
    pub fn wait_all_threads(&self, pred: impl Fn(&ThreadData) -> bool) {
        let threads = self.lock_for_iter();
        for thread in threads.iter() {
            let backoff = Backoff::new();
            while !pred(thread) {
                backoff.snooze();
                if backoff.is_completed() {
                    std::thread::yield_now();
                }
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadData>>> = const { RefCell::new(None) };
}

/// Is a mutator attached on the calling thread
pub fn is_current_thread_attached() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

pub(crate) fn current_thread() -> Option<Arc<ThreadData>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn set_current_thread(thread: Option<Arc<ThreadData>>) {
    CURRENT.with(|current| *current.borrow_mut() = thread);
}
