//! Aggressive scheduling policy (debugging aid)
//!
//! Keeps safepoints permanently active and schedules a collection the first
//! time any thread reaches a given safepoint site. Allocation boundaries are
//! honoured as in the adaptive policy.

use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::GcSchedulerConfig;
use crate::safepoint::{SafePointActivator, SafePoints};

use super::assists::MutatorAssists;
use super::tracker::SafePointTracker;
use super::{BoundaryTrigger, GcSchedulerData, ScheduleGc};

/// Collect at every new safepoint site
pub struct AggressiveSchedulerData {
    trigger: BoundaryTrigger,
    tracker: Mutex<SafePointTracker>,
    _activator: SafePointActivator,
}

impl AggressiveSchedulerData {
    /// Build the policy; safepoints stay active for its whole lifetime
    pub fn new(
        config: &GcSchedulerConfig,
        safepoints: &SafePoints,
        schedule_gc: ScheduleGc,
        assists: Arc<MutatorAssists>,
    ) -> Self {
        Self {
            trigger: BoundaryTrigger::new(config, schedule_gc, assists),
            tracker: Mutex::new(SafePointTracker::default()),
            _activator: safepoints.activate(),
        }
    }
}

impl GcSchedulerData for AggressiveSchedulerData {
    fn on_perform_full_gc(&self) {}

    fn set_allocated_bytes(&self, bytes: usize) {
        self.trigger.set_allocated_bytes(bytes);
    }

    fn update_alive_set_bytes(&self, bytes: usize) {
        self.trigger.controller().update_alive_set_bytes(bytes);
    }

    fn safe_point(&self, site: &'static Location<'static>) {
        if self.tracker.lock().register_safe_point(site) {
            let epoch = self.trigger.schedule();
            tracing::debug!(target: "otter::gc", epoch, %site, "new safepoint site, collection scheduled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_schedules_once_per_site() {
        let safepoints = SafePoints::new();
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let data = AggressiveSchedulerData::new(
            &GcSchedulerConfig::default(),
            &safepoints,
            Arc::new(move || c.fetch_add(1, Ordering::SeqCst) + 1),
            Arc::new(MutatorAssists::new(safepoints.counter().clone())),
        );
        assert!(safepoints.is_active());

        let a = here();
        let b = here();
        data.safe_point(a);
        data.safe_point(a);
        data.safe_point(b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(data);
        assert!(!safepoints.is_active());
    }
}
