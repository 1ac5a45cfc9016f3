//! Adaptive scheduling policy
//!
//! Collections are triggered by the heap growth boundaries, and by a timer
//! when no collection ran for a whole `regular_gc_interval` while the app is
//! in the foreground.

use std::sync::Arc;

use crate::config::GcSchedulerConfig;

use super::assists::MutatorAssists;
use super::pacer::{RegularIntervalPacer, RepeatedTimer};
use super::{AppState, AppStateTracking, BoundaryTrigger, GcSchedulerData, ScheduleGc};

/// Heap growth plus regular interval
pub struct AdaptiveSchedulerData {
    trigger: BoundaryTrigger,
    pacer: Arc<RegularIntervalPacer>,
    timer: RepeatedTimer,
}

impl AdaptiveSchedulerData {
    /// Start the policy and its timer thread
    pub fn new(
        config: &GcSchedulerConfig,
        app_state: Arc<AppStateTracking>,
        schedule_gc: ScheduleGc,
        assists: Arc<MutatorAssists>,
    ) -> Self {
        let pacer = Arc::new(RegularIntervalPacer::new(config.regular_gc_interval));
        let timer = {
            let pacer = pacer.clone();
            let schedule_gc = schedule_gc.clone();
            RepeatedTimer::new("otter-gc-timer", config.regular_gc_interval, move || {
                if app_state.state() == AppState::Background {
                    return;
                }
                if pacer.needs_gc() {
                    let epoch = schedule_gc();
                    tracing::debug!(target: "otter::gc", epoch, "regular collection scheduled");
                }
            })
        };
        Self {
            trigger: BoundaryTrigger::new(config, schedule_gc, assists),
            pacer,
            timer,
        }
    }

    /// Current hard boundary
    pub fn target_heap_bytes(&self) -> usize {
        self.trigger.controller().target_heap_bytes()
    }
}

impl GcSchedulerData for AdaptiveSchedulerData {
    fn on_perform_full_gc(&self) {
        self.pacer.on_perform_full_gc();
        self.timer.restart();
    }

    fn set_allocated_bytes(&self, bytes: usize) {
        self.trigger.set_allocated_bytes(bytes);
    }

    fn update_alive_set_bytes(&self, bytes: usize) {
        self.trigger.controller().update_alive_set_bytes(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::SafePoints;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    fn adaptive(
        interval: Duration,
        app_state: Arc<AppStateTracking>,
    ) -> (AdaptiveSchedulerData, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let safepoints = SafePoints::new();
        let config = GcSchedulerConfig {
            regular_gc_interval: interval,
            ..GcSchedulerConfig::default()
        };
        let data = AdaptiveSchedulerData::new(
            &config,
            app_state,
            Arc::new(move || c.fetch_add(1, Ordering::SeqCst) + 1),
            Arc::new(MutatorAssists::new(safepoints.counter().clone())),
        );
        (data, calls)
    }

    #[test]
    fn test_timer_schedules_in_foreground() {
        let (_data, calls) = adaptive(Duration::from_millis(5), Arc::default());
        let deadline = Instant::now() + Duration::from_secs(10);
        while calls.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_timer_skips_background() {
        let app_state = Arc::new(AppStateTracking::default());
        app_state.set_state(AppState::Background);
        let (_data, calls) = adaptive(Duration::from_millis(2), app_state);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_alive_set_retunes_target() {
        let (data, _) = adaptive(Duration::from_secs(3600), Arc::default());
        let before = data.target_heap_bytes();
        data.update_alive_set_bytes(before);
        assert_eq!(data.target_heap_bytes(), before * 2);
    }
}
