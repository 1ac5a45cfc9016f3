//! Memory manager runtime
//!
//! [`Runtime`] is the explicitly constructed process context: it owns the
//! thread registry, the allocator, the scheduler, the collector state and
//! the GC thread. Mutator threads attach through [`RuntimeHandle::attach_thread`].
//!
//! ```ignore
//! let runtime = Runtime::builder().gc(GcKind::Concurrent).build()?;
//! let mutator = runtime.attach_thread("main");
//! let obj = mutator.allocate_object(&NODE);
//! mutator.push_root(obj);
//! mutator.schedule_and_wait_finished();
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::allocator::Allocator;
use crate::barrier::Barriers;
use crate::collector::{Collector, CollectorPhase, gc_thread_loop};
use crate::config::{GcConfig, GcKind, SchedulerKind};
use crate::error::{ConfigError, Result};
use crate::gc_state::{Epoch, GcStateHolder};
use crate::mutator::Mutator;
use crate::object::ObjRef;
use crate::roots::{RootRegistry, RootSet, StableRef};
use crate::safepoint::{SafePointAction, SafePoints};
use crate::scheduler::{AppState, AppStateTracking, GcScheduler, ScheduleGc};
use crate::statistics::{GcEpochStats, GcStatistics, GcTotals};
use crate::suspension::ThreadSuspension;
use crate::thread::{ThreadRegistry, ThreadState, current_thread, is_current_thread_attached};
use crate::weak_ref::WeakRefRegistry;

/// State shared by the GC thread, the finalizer callback and every mutator
pub(crate) struct GlobalData {
    pub(crate) config: GcConfig,
    pub(crate) threads: ThreadRegistry,
    pub(crate) safepoints: SafePoints,
    pub(crate) suspension: ThreadSuspension,
    pub(crate) gc_state: Arc<GcStateHolder>,
    pub(crate) scheduler: GcScheduler,
    pub(crate) allocator: Allocator,
    pub(crate) barriers: Barriers,
    pub(crate) weak_refs: WeakRefRegistry,
    pub(crate) roots: RootRegistry,
    pub(crate) extra_roots: Option<Arc<dyn RootSet>>,
    pub(crate) app_state: Arc<AppStateTracking>,
    pub(crate) stats: GcStatistics,
    pub(crate) collector: Collector,
}

impl GlobalData {
    fn new(config: GcConfig, extra_roots: Option<Arc<dyn RootSet>>) -> Self {
        let gc_state = Arc::new(GcStateHolder::new());
        let safepoints = SafePoints::new();
        let app_state = Arc::new(AppStateTracking::default());

        let schedule_gc: ScheduleGc = {
            let gc_state = gc_state.clone();
            Arc::new(move || gc_state.schedule())
        };
        let scheduler = GcScheduler::new(
            config.scheduler,
            &config.scheduler_config,
            &safepoints,
            app_state.clone(),
            schedule_gc,
        );

        let allocator = {
            let gc_state = gc_state.clone();
            Allocator::new(move |epoch| gc_state.finalized(epoch))
        };
        if config.start_finalizer_thread {
            allocator.finalizer_processor().start_finalizer_thread_if_needed();
        }

        Self {
            collector: Collector::new(config.gc),
            config,
            threads: ThreadRegistry::new(),
            safepoints,
            suspension: ThreadSuspension::default(),
            gc_state,
            scheduler,
            allocator,
            barriers: Barriers::default(),
            weak_refs: WeakRefRegistry::default(),
            roots: RootRegistry::default(),
            extra_roots,
            app_state,
            stats: GcStatistics::default(),
        }
    }
}

/// Builder for a [`Runtime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    config: GcConfig,
    root_set: Option<Arc<dyn RootSet>>,
}

impl RuntimeBuilder {
    /// Replace the whole configuration
    pub fn config(mut self, config: GcConfig) -> Self {
        self.config = config;
        self
    }

    /// Collector variant
    pub fn gc(mut self, kind: GcKind) -> Self {
        self.config.gc = kind;
        self
    }

    /// Scheduler policy
    pub fn scheduler(mut self, kind: SchedulerKind) -> Self {
        self.config.scheduler = kind;
        self
    }

    /// Additional root set consulted next to the built-in registry
    pub fn root_set(mut self, root_set: Arc<dyn RootSet>) -> Self {
        self.root_set = Some(root_set);
        self
    }

    /// Validate the configuration and start the GC thread
    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let kind = self.config.gc;
        let scheduler = self.config.scheduler;
        let global = Arc::new(GlobalData::new(self.config, self.root_set));

        let gc_thread = {
            let global = global.clone();
            std::thread::Builder::new()
                .name("otter-gc".into())
                .spawn(move || gc_thread_loop(global))
                .map_err(|e| ConfigError::ThreadSpawn {
                    name: "otter-gc",
                    message: e.to_string(),
                })?
        };

        tracing::info!(target: "otter::gc", ?kind, ?scheduler, "memory manager started");
        Ok(Runtime {
            handle: RuntimeHandle { global },
            gc_thread: Some(gc_thread),
        })
    }
}

/// Owner of the memory manager. Dropping it stops the GC thread.
pub struct Runtime {
    handle: RuntimeHandle,
    gc_thread: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Start a runtime with `config`
    pub fn new(config: GcConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Start configuring a runtime
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Cloneable handle for other threads
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }
}

impl Deref for Runtime {
    type Target = RuntimeHandle;

    fn deref(&self) -> &RuntimeHandle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let global = &self.handle.global;
        global.gc_state.shutdown();
        // No epoch completes after this; release mutators parked on assists
        global.scheduler.assists().shutdown();
        let Some(gc_thread) = self.gc_thread.take() else {
            return;
        };
        // A collection in flight may be waiting for this thread to stop
        let attached = current_thread().filter(|t| t.state() == ThreadState::Runnable);
        if let Some(thread) = &attached {
            thread.enter_native();
        }
        if gc_thread.join().is_err() {
            tracing::error!(target: "otter::gc", "GC thread panicked");
        }
        if let Some(thread) = &attached {
            thread.leave_native(&global.suspension);
        }
        tracing::info!(
            target: "otter::gc",
            collections = global.stats.totals().collections,
            "memory manager stopped"
        );
    }
}

/// Cloneable, `Send` access to a [`Runtime`]
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) global: Arc<GlobalData>,
}

impl RuntimeHandle {
    /// Attach the calling thread as a mutator.
    ///
    /// # Panics
    /// If the thread is already attached.
    pub fn attach_thread(&self, name: impl Into<String>) -> Mutator {
        Mutator::attach(self.global.clone(), name.into())
    }

    /// Schedule a collection without waiting. Returns the serving epoch.
    pub fn schedule(&self) -> Epoch {
        self.global.scheduler.schedule()
    }

    /// Schedule a collection and wait until it is finished.
    ///
    /// # Panics
    /// If called from an attached thread; use [`Mutator::schedule_and_wait_finished`].
    pub fn schedule_and_wait_finished(&self) -> Epoch {
        assert!(
            !is_current_thread_attached(),
            "attached threads must wait through their Mutator"
        );
        let epoch = self.schedule();
        self.global.gc_state.wait_epoch_finished(epoch);
        epoch
    }

    /// Schedule a collection and wait until its finalizers have run.
    ///
    /// # Panics
    /// If called from an attached thread; use [`Mutator::schedule_and_wait_finalized`].
    pub fn schedule_and_wait_finalized(&self) -> Epoch {
        assert!(
            !is_current_thread_attached(),
            "attached threads must wait through their Mutator"
        );
        let epoch = self.schedule();
        self.global.gc_state.wait_epoch_finalized(epoch);
        epoch
    }

    /// Block until `epoch` is finished
    pub fn wait_epoch_finished(&self, epoch: Epoch) {
        self.global.gc_state.wait_epoch_finished(epoch);
    }

    /// Block until `epoch` is finalized
    pub fn wait_epoch_finalized(&self, epoch: Epoch) {
        self.global.gc_state.wait_epoch_finalized(epoch);
    }

    /// Root `obj` until the returned handle is dropped
    pub fn create_stable_ref(&self, obj: ObjRef) -> StableRef {
        self.global.roots.create_stable_ref(obj)
    }

    /// Current state of the collector
    pub fn collector_phase(&self) -> CollectorPhase {
        self.global.collector.phase()
    }

    /// Collector variant
    pub fn gc_kind(&self) -> GcKind {
        self.global.collector.kind()
    }

    /// Statistics of the last finished collection
    pub fn last_gc_stats(&self) -> Option<GcEpochStats> {
        self.global.stats.last()
    }

    /// Cumulative collection counters
    pub fn gc_totals(&self) -> GcTotals {
        self.global.stats.totals()
    }

    /// Report foreground/background state to the scheduler
    pub fn set_app_state(&self, state: AppState) {
        self.global.app_state.set_state(state);
    }

    /// Bytes currently allocated, published or not
    pub fn allocated_bytes(&self) -> usize {
        self.global.allocator.allocated_bytes()
    }

    /// Published objects
    pub fn object_count(&self) -> usize {
        self.global.allocator.object_count()
    }

    /// Attached mutators
    pub fn thread_count(&self) -> usize {
        self.global.threads.len()
    }

    /// Epoch counters as `(scheduled, started, finished, finalized)`
    pub fn epochs(&self) -> (Epoch, Epoch, Epoch, Epoch) {
        let state = &self.global.gc_state;
        (
            state.scheduled(),
            state.started(),
            state.finished(),
            state.finalized_epoch(),
        )
    }

    /// Configuration the runtime was built with
    pub fn config(&self) -> &GcConfig {
        &self.global.config
    }

    /// Register an action every mutator runs on the safepoint slow path.
    /// Returns false if another action is registered.
    pub fn try_set_safe_point_action(&self, action: SafePointAction) -> bool {
        self.global.safepoints.try_set_action(action)
    }

    /// Unregister the safepoint action.
    ///
    /// # Panics
    /// If none is registered.
    pub fn unset_safe_point_action(&self) {
        self.global.safepoints.unset_action();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = GcConfig::default();
        config.scheduler_config.regular_gc_interval = Duration::ZERO;
        assert!(matches!(
            Runtime::new(config),
            Err(ConfigError::ZeroInterval)
        ));
    }

    #[test]
    fn test_schedule_from_unattached_thread() {
        let runtime = Runtime::builder()
            .scheduler(SchedulerKind::Manual)
            .build()
            .unwrap();
        assert_eq!(runtime.collector_phase(), CollectorPhase::Idle);

        let first = runtime.schedule_and_wait_finished();
        let second = runtime.schedule_and_wait_finalized();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let (scheduled, started, finished, finalized) = runtime.epochs();
        assert_eq!((scheduled, started, finished), (2, 2, 2));
        assert_eq!(finalized, 2);
        assert_eq!(runtime.gc_totals().collections, 2);
    }

    #[test]
    fn test_noop_completes_epochs() {
        let runtime = Runtime::builder()
            .gc(GcKind::NoOp)
            .scheduler(SchedulerKind::Manual)
            .build()
            .unwrap();
        assert_eq!(runtime.schedule_and_wait_finalized(), 1);
        assert!(runtime.last_gc_stats().is_none());
        assert_eq!(runtime.collector_phase(), CollectorPhase::Idle);
    }

    #[test]
    fn test_handle_schedules_from_another_thread() {
        let runtime = Runtime::builder()
            .scheduler(SchedulerKind::Manual)
            .build()
            .unwrap();
        let handle = runtime.handle();
        let epoch = std::thread::spawn(move || handle.schedule_and_wait_finished())
            .join()
            .unwrap();
        assert_eq!(epoch, 1);
    }
}
