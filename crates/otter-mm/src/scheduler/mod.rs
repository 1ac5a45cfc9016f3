//! GC scheduling
//!
//! The [`GcScheduler`] decides when collections happen. The policy lives
//! behind [`GcSchedulerData`]:
//!
//! - [`adaptive`]: heap growth boundaries plus a regular interval timer
//! - [`aggressive`]: a collection at every newly seen safepoint site, plus
//!   the heap growth boundaries (debugging aid)
//! - [`manual`]: only explicit requests
//!
//! Crossing the soft boundary schedules a collection; crossing the hard one
//! also requests mutator assists for the scheduled epoch, which throttles
//! allocating threads until the collector catches up.

pub mod adaptive;
pub mod aggressive;
pub mod assists;
pub mod delay;
pub mod heap_growth;
pub mod manual;
pub mod pacer;
pub mod tracker;

use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::{GcSchedulerConfig, SchedulerKind};
use crate::gc_state::Epoch;
use crate::safepoint::SafePoints;
use crate::thread::ThreadRegistry;

use self::adaptive::AdaptiveSchedulerData;
use self::aggressive::AggressiveSchedulerData;
use self::assists::MutatorAssists;
use self::delay::GcDelay;
use self::heap_growth::{HeapGrowthController, MemoryBoundary};
use self::manual::ManualSchedulerData;

/// Callback that schedules a collection and returns its epoch
pub type ScheduleGc = Arc<dyn Fn() -> Epoch + Send + Sync>;

/// Scheduling policy
pub trait GcSchedulerData: Send + Sync {
    /// A collection is starting
    fn on_perform_full_gc(&self);

    /// Allocated total changed
    fn set_allocated_bytes(&self, bytes: usize);

    /// Alive bytes measured by the last collection
    fn update_alive_set_bytes(&self, bytes: usize);

    /// A mutator passed the safepoint slow path at `site`
    fn safe_point(&self, _site: &'static Location<'static>) {}
}

/// Application visibility
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Visible; regular collections run
    Foreground = 0,
    /// Hidden; the adaptive timer does not schedule
    Background = 1,
}

/// Shared application state
#[derive(Debug)]
pub struct AppStateTracking {
    state: AtomicU8,
}

impl Default for AppStateTracking {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(AppState::Foreground as u8),
        }
    }
}

impl AppStateTracking {
    /// Current state
    pub fn state(&self) -> AppState {
        match self.state.load(Ordering::Relaxed) {
            0 => AppState::Foreground,
            _ => AppState::Background,
        }
    }

    /// Update the state
    pub fn set_state(&self, state: AppState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Reaction to allocation boundaries, shared by the adaptive and aggressive
/// policies
pub(crate) struct BoundaryTrigger {
    controller: HeapGrowthController,
    schedule_gc: ScheduleGc,
    assists: Arc<MutatorAssists>,
}

impl BoundaryTrigger {
    pub(crate) fn new(
        config: &GcSchedulerConfig,
        schedule_gc: ScheduleGc,
        assists: Arc<MutatorAssists>,
    ) -> Self {
        Self {
            controller: HeapGrowthController::new(config),
            schedule_gc,
            assists,
        }
    }

    pub(crate) fn controller(&self) -> &HeapGrowthController {
        &self.controller
    }

    pub(crate) fn schedule(&self) -> Epoch {
        (self.schedule_gc)()
    }

    pub(crate) fn set_allocated_bytes(&self, bytes: usize) {
        match self.controller.set_allocated_bytes(bytes) {
            MemoryBoundary::None => {}
            MemoryBoundary::Soft => {
                let epoch = self.schedule();
                tracing::debug!(
                    target: "otter::gc",
                    epoch,
                    bytes,
                    soft = self.controller.soft_heap_bytes(),
                    "soft heap boundary reached, collection scheduled"
                );
            }
            MemoryBoundary::Hard => {
                let epoch = self.schedule();
                tracing::warn!(
                    target: "otter::gc",
                    epoch,
                    bytes,
                    target = self.controller.target_heap_bytes(),
                    "hard heap boundary reached, pausing mutators"
                );
                self.assists.request_assists(epoch);
            }
        }
    }
}

/// Scheduler facade owned by the runtime
pub struct GcScheduler {
    config: GcSchedulerConfig,
    data: Box<dyn GcSchedulerData>,
    assists: Arc<MutatorAssists>,
    delay: GcDelay,
    schedule_gc: ScheduleGc,
}

impl GcScheduler {
    /// Build the scheduler for `kind`
    pub fn new(
        kind: SchedulerKind,
        config: &GcSchedulerConfig,
        safepoints: &SafePoints,
        app_state: Arc<AppStateTracking>,
        schedule_gc: ScheduleGc,
    ) -> Self {
        let assists = Arc::new(MutatorAssists::new(safepoints.counter().clone()));
        let data: Box<dyn GcSchedulerData> = match kind {
            SchedulerKind::Adaptive => Box::new(AdaptiveSchedulerData::new(
                config,
                app_state,
                schedule_gc.clone(),
                assists.clone(),
            )),
            SchedulerKind::Aggressive => Box::new(AggressiveSchedulerData::new(
                config,
                safepoints,
                schedule_gc.clone(),
                assists.clone(),
            )),
            SchedulerKind::Manual => Box::new(ManualSchedulerData),
        };
        Self {
            config: config.clone(),
            data,
            assists,
            delay: GcDelay::default(),
            schedule_gc,
        }
    }

    /// Scheduler knobs
    pub fn config(&self) -> &GcSchedulerConfig {
        &self.config
    }

    /// Policy
    pub fn gc_data(&self) -> &dyn GcSchedulerData {
        self.data.as_ref()
    }

    /// Mutator assists
    pub fn assists(&self) -> &MutatorAssists {
        &self.assists
    }

    /// Collection start gate
    pub fn gc_delay(&self) -> &GcDelay {
        &self.delay
    }

    /// Schedule a collection (coalescing with a pending one)
    pub fn schedule(&self) -> Epoch {
        (self.schedule_gc)()
    }

    /// The collector is starting an epoch
    pub fn on_gc_start(&self) {
        self.data.on_perform_full_gc();
    }

    /// The collector swept `epoch`; `alive_bytes` is what remains allocated
    pub fn on_gc_finish(&self, epoch: Epoch, alive_bytes: usize, threads: &ThreadRegistry) {
        self.data.update_alive_set_bytes(alive_bytes);
        self.assists.complete_epoch(epoch, threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_schedule() -> (ScheduleGc, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let schedule: ScheduleGc = Arc::new(move || c.fetch_add(1, Ordering::SeqCst) + 1);
        (schedule, calls)
    }

    fn small_heap() -> GcSchedulerConfig {
        GcSchedulerConfig {
            target_heap_bytes: 10,
            target_heap_soft_coefficient: 0.7,
            min_heap_bytes: 5,
            max_heap_bytes: 1000,
            ..GcSchedulerConfig::default()
        }
    }

    #[test]
    fn test_boundary_trigger() {
        let safepoints = SafePoints::new();
        let (schedule, calls) = counting_schedule();
        let assists = Arc::new(MutatorAssists::new(safepoints.counter().clone()));
        let trigger = BoundaryTrigger::new(&small_heap(), schedule, assists.clone());

        trigger.set_allocated_bytes(6);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        trigger.set_allocated_bytes(8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!assists.is_active());

        trigger.set_allocated_bytes(10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(assists.is_active());
        assert_eq!(assists.pending_epoch(), Some(2));
        assert!(safepoints.is_active());
    }

    #[test]
    fn test_on_gc_finish_completes_assists() {
        let safepoints = SafePoints::new();
        let threads = ThreadRegistry::new();
        let (schedule, _) = counting_schedule();
        let scheduler = GcScheduler::new(
            SchedulerKind::Manual,
            &small_heap(),
            &safepoints,
            Arc::new(AppStateTracking::default()),
            schedule,
        );
        scheduler.assists().request_assists(1);
        assert!(safepoints.is_active());

        scheduler.on_gc_start();
        scheduler.on_gc_finish(1, 0, &threads);
        assert!(!safepoints.is_active());
        assert_eq!(scheduler.schedule(), 1);
    }

    #[test]
    fn test_app_state() {
        let app = AppStateTracking::default();
        assert_eq!(app.state(), AppState::Foreground);
        app.set_state(AppState::Background);
        assert_eq!(app.state(), AppState::Background);
    }
}
