//! Heap growth controller
//!
//! Holds a target heap size and its soft fraction. Allocation totals are
//! classified against both; after each collection the target is recomputed
//! from the alive set so the heap stays at the configured utilization.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::GcSchedulerConfig;

/// Which boundary the allocated total crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBoundary {
    /// Below the soft boundary
    None,
    /// At or above the soft boundary: schedule a collection
    Soft,
    /// At or above the target: schedule and make mutators assist
    Hard,
}

/// Soft/hard boundary tracking
#[derive(Debug)]
pub struct HeapGrowthController {
    min_heap_bytes: usize,
    max_heap_bytes: usize,
    target_heap_utilization: f64,
    soft_coefficient: f64,
    auto_tune: bool,
    target_heap_bytes: AtomicUsize,
    soft_heap_bytes: AtomicUsize,
}

impl HeapGrowthController {
    /// Start from the configured target
    pub fn new(config: &GcSchedulerConfig) -> Self {
        let target = config.target_heap_bytes;
        Self {
            min_heap_bytes: config.min_heap_bytes,
            max_heap_bytes: config.max_heap_bytes,
            target_heap_utilization: config.target_heap_utilization,
            soft_coefficient: config.target_heap_soft_coefficient,
            auto_tune: config.auto_tune,
            target_heap_bytes: AtomicUsize::new(target),
            soft_heap_bytes: AtomicUsize::new(soft_bytes(target, config.target_heap_soft_coefficient)),
        }
    }

    /// Classify the current allocated total
    pub fn set_allocated_bytes(&self, bytes: usize) -> MemoryBoundary {
        if bytes >= self.target_heap_bytes.load(Ordering::Relaxed) {
            MemoryBoundary::Hard
        } else if bytes >= self.soft_heap_bytes.load(Ordering::Relaxed) {
            MemoryBoundary::Soft
        } else {
            MemoryBoundary::None
        }
    }

    /// Recompute the boundaries from the alive set after a collection
    pub fn update_alive_set_bytes(&self, bytes: usize) {
        if !self.auto_tune {
            return;
        }
        let target = bytes as f64 / self.target_heap_utilization;
        let target = if target.is_finite() {
            target.clamp(self.min_heap_bytes as f64, self.max_heap_bytes as f64) as usize
        } else {
            self.max_heap_bytes
        };
        self.target_heap_bytes.store(target, Ordering::Relaxed);
        self.soft_heap_bytes
            .store(soft_bytes(target, self.soft_coefficient), Ordering::Relaxed);
    }

    /// Current hard boundary
    pub fn target_heap_bytes(&self) -> usize {
        self.target_heap_bytes.load(Ordering::Relaxed)
    }

    /// Current soft boundary
    pub fn soft_heap_bytes(&self) -> usize {
        self.soft_heap_bytes.load(Ordering::Relaxed)
    }
}

fn soft_bytes(target: usize, coefficient: f64) -> usize {
    (target as f64 * coefficient) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auto_tune: bool) -> GcSchedulerConfig {
        GcSchedulerConfig {
            target_heap_bytes: 10,
            target_heap_soft_coefficient: 0.7,
            min_heap_bytes: 5,
            max_heap_bytes: 1000,
            auto_tune,
            ..GcSchedulerConfig::default()
        }
    }

    #[test]
    fn test_boundaries() {
        let controller = HeapGrowthController::new(&config(false));
        assert_eq!(controller.soft_heap_bytes(), 7);
        for bytes in 0..=6 {
            assert_eq!(controller.set_allocated_bytes(bytes), MemoryBoundary::None);
        }
        for bytes in 7..=9 {
            assert_eq!(controller.set_allocated_bytes(bytes), MemoryBoundary::Soft);
        }
        for bytes in 10..=11 {
            assert_eq!(controller.set_allocated_bytes(bytes), MemoryBoundary::Hard);
        }
    }

    #[test]
    fn test_no_tuning_when_disabled() {
        let controller = HeapGrowthController::new(&config(false));
        controller.update_alive_set_bytes(500);
        assert_eq!(controller.target_heap_bytes(), 10);
        assert_eq!(controller.soft_heap_bytes(), 7);
    }

    #[test]
    fn test_auto_tune() {
        let controller = HeapGrowthController::new(&GcSchedulerConfig {
            min_heap_bytes: 10,
            max_heap_bytes: 1000,
            target_heap_bytes: 100,
            target_heap_utilization: 0.5,
            target_heap_soft_coefficient: 0.7,
            auto_tune: true,
            ..GcSchedulerConfig::default()
        });

        let cases = [
            (0, 10, 7),
            (10, 20, 14),
            (100, 200, 140),
            (10_000, 1000, 700),
            (u32::MAX as usize, 1000, 700),
        ];
        for (alive, target, soft) in cases {
            controller.update_alive_set_bytes(alive);
            assert_eq!(controller.target_heap_bytes(), target, "alive = {alive}");
            assert_eq!(controller.soft_heap_bytes(), soft, "alive = {alive}");
        }

        controller.update_alive_set_bytes(100);
        assert_eq!(controller.set_allocated_bytes(139), MemoryBoundary::None);
        assert_eq!(controller.set_allocated_bytes(140), MemoryBoundary::Soft);
        assert_eq!(controller.set_allocated_bytes(200), MemoryBoundary::Hard);
    }
}
