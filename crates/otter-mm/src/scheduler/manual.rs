//! Manual scheduling policy: collections happen only on explicit request.

use super::GcSchedulerData;

/// Never schedules on its own
#[derive(Debug, Default)]
pub struct ManualSchedulerData;

impl GcSchedulerData for ManualSchedulerData {
    fn on_perform_full_gc(&self) {}

    fn set_allocated_bytes(&self, _bytes: usize) {}

    fn update_alive_set_bytes(&self, _bytes: usize) {}
}
