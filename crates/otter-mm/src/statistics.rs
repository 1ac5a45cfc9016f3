//! Collection statistics
//!
//! The collector opens a [`GcHandle`] per epoch and reports every state
//! transition through it. Transitions are logged under the `otter::gc`
//! target; the finished record is kept as the last epoch's statistics and
//! folded into cumulative counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::allocator::SweepStats;
use crate::config::GcKind;
use crate::gc_state::Epoch;
use crate::mark::MarkStats;

/// Record of one collection
#[derive(Debug, Clone, PartialEq)]
pub struct GcEpochStats {
    /// Epoch
    pub epoch: Epoch,
    /// Collector variant that ran it
    pub kind: GcKind,
    /// Allocated bytes when the collection started
    pub heap_bytes_before: usize,
    /// Allocated bytes after the sweep (including pending finalizers)
    pub heap_bytes_after: usize,
    /// Distinct root objects
    pub roots: usize,
    /// Marking counters
    pub mark: MarkStats,
    /// Weak references cleared
    pub weaks_cleared: usize,
    /// Sweep counters
    pub sweep: SweepStats,
    /// Time mutators spent suspended
    pub pause: Duration,
    /// Time from start to finish
    pub duration: Duration,
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcTotals {
    /// Finished collections
    pub collections: u64,
    /// Bytes freed by sweeps
    pub swept_bytes: u64,
    /// Objects handed to the finalizer thread
    pub finalized_objects: u64,
    /// Sum of pauses
    pub total_pause: Duration,
}

/// Statistics sink shared by the runtime
#[derive(Debug, Default)]
pub struct GcStatistics {
    last: Mutex<Option<GcEpochStats>>,
    collections: AtomicU64,
    swept_bytes: AtomicU64,
    finalized_objects: AtomicU64,
    total_pause_nanos: AtomicU64,
    in_progress: AtomicUsize,
}

impl GcStatistics {
    /// Record of the last finished collection
    pub fn last(&self) -> Option<GcEpochStats> {
        self.last.lock().clone()
    }

    /// Cumulative counters
    pub fn totals(&self) -> GcTotals {
        GcTotals {
            collections: self.collections.load(Ordering::Relaxed),
            swept_bytes: self.swept_bytes.load(Ordering::Relaxed),
            finalized_objects: self.finalized_objects.load(Ordering::Relaxed),
            total_pause: Duration::from_nanos(self.total_pause_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Is a collection being recorded right now
    pub fn is_collecting(&self) -> bool {
        self.in_progress.load(Ordering::Relaxed) > 0
    }

    fn record(&self, stats: GcEpochStats) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.swept_bytes
            .fetch_add(stats.sweep.swept_bytes as u64, Ordering::Relaxed);
        self.finalized_objects
            .fetch_add(stats.sweep.finalizers as u64, Ordering::Relaxed);
        self.total_pause_nanos
            .fetch_add(stats.pause.as_nanos() as u64, Ordering::Relaxed);
        *self.last.lock() = Some(stats);
    }
}

/// Per-epoch reporting handle
pub struct GcHandle<'a> {
    sink: &'a GcStatistics,
    record: GcEpochStats,
    started: Instant,
    pause_started: Option<Instant>,
}

impl<'a> GcHandle<'a> {
    /// Open the record for `epoch`
    pub fn create(sink: &'a GcStatistics, epoch: Epoch, kind: GcKind, heap_bytes: usize) -> Self {
        sink.in_progress.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "otter::gc", epoch, ?kind, heap_bytes, "GC epoch scheduled");
        Self {
            sink,
            record: GcEpochStats {
                epoch,
                kind,
                heap_bytes_before: heap_bytes,
                heap_bytes_after: heap_bytes,
                roots: 0,
                mark: MarkStats::default(),
                weaks_cleared: 0,
                sweep: SweepStats::default(),
                pause: Duration::ZERO,
                duration: Duration::ZERO,
            },
            started: Instant::now(),
            pause_started: None,
        }
    }

    /// Epoch of this record
    pub fn epoch(&self) -> Epoch {
        self.record.epoch
    }

    /// Suspension was requested
    pub fn suspension_requested(&mut self) {
        self.pause_started = Some(Instant::now());
        tracing::debug!(target: "otter::gc", epoch = self.record.epoch, "threads suspension requested");
    }

    /// Every mutator is suspended or native
    pub fn threads_suspended(&mut self) {
        let waited = self.pause_started.map(|t| t.elapsed()).unwrap_or_default();
        tracing::debug!(
            target: "otter::gc",
            epoch = self.record.epoch,
            wait_us = waited.as_micros() as u64,
            "threads suspended"
        );
    }

    /// Root set collected
    pub fn root_set_collected(&mut self, roots: usize) {
        self.record.roots = roots;
        tracing::debug!(target: "otter::gc", epoch = self.record.epoch, roots, "root set collected");
    }

    /// Marking finished
    pub fn marked(&mut self, stats: MarkStats) {
        self.record.mark = stats;
        tracing::debug!(
            target: "otter::gc",
            epoch = self.record.epoch,
            objects = stats.marked_objects,
            bytes = stats.marked_bytes,
            "marking finished"
        );
    }

    /// Weak references processed
    pub fn weaks_processed(&mut self, cleared: usize) {
        self.record.weaks_cleared = cleared;
        tracing::debug!(target: "otter::gc", epoch = self.record.epoch, cleared, "weak references processed");
    }

    /// Sweep finished
    pub fn swept(&mut self, stats: SweepStats, heap_bytes: usize) {
        self.record.sweep = stats;
        self.record.heap_bytes_after = heap_bytes;
        tracing::debug!(
            target: "otter::gc",
            epoch = self.record.epoch,
            swept_objects = stats.swept_objects,
            swept_bytes = stats.swept_bytes,
            kept_objects = stats.kept_objects,
            "sweep finished"
        );
    }

    /// Mutators resumed
    pub fn threads_resumed(&mut self) {
        if let Some(started) = self.pause_started.take() {
            self.record.pause = started.elapsed();
        }
        tracing::debug!(
            target: "otter::gc",
            epoch = self.record.epoch,
            pause_us = self.record.pause.as_micros() as u64,
            "threads resumed"
        );
    }

    /// Finalizers handed to the finalizer thread
    pub fn finalizers_scheduled(&mut self, count: usize) {
        tracing::debug!(target: "otter::gc", epoch = self.record.epoch, count, "finalizers scheduled");
    }

    /// Close the record
    pub fn finished(mut self) {
        self.record.duration = self.started.elapsed();
        let r = &self.record;
        tracing::info!(
            target: "otter::gc",
            epoch = r.epoch,
            kind = ?r.kind,
            pause_us = r.pause.as_micros() as u64,
            duration_us = r.duration.as_micros() as u64,
            marked_objects = r.mark.marked_objects,
            swept_objects = r.sweep.swept_objects,
            swept_bytes = r.sweep.swept_bytes,
            finalizers = r.sweep.finalizers,
            heap_before = r.heap_bytes_before,
            heap_after = r.heap_bytes_after,
            "GC epoch finished"
        );
        let record = self.record.clone();
        self.sink.record(record);
    }
}

impl Drop for GcHandle<'_> {
    fn drop(&mut self) {
        self.sink.in_progress.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let sink = GcStatistics::default();
        assert!(sink.last().is_none());

        let mut handle = GcHandle::create(&sink, 1, GcKind::StopTheWorld, 100);
        assert!(sink.is_collecting());
        handle.suspension_requested();
        handle.threads_suspended();
        handle.root_set_collected(2);
        handle.marked(MarkStats {
            roots: 2,
            marked_objects: 3,
            marked_bytes: 60,
        });
        handle.weaks_processed(1);
        handle.swept(
            SweepStats {
                kept_objects: 3,
                kept_bytes: 60,
                swept_objects: 2,
                swept_bytes: 40,
                swept_extras: 0,
                finalizers: 1,
            },
            60,
        );
        handle.threads_resumed();
        handle.finalizers_scheduled(1);
        handle.finished();
        assert!(!sink.is_collecting());

        let last = sink.last().unwrap();
        assert_eq!(last.epoch, 1);
        assert_eq!(last.roots, 2);
        assert_eq!(last.weaks_cleared, 1);
        assert_eq!(last.heap_bytes_before, 100);
        assert_eq!(last.heap_bytes_after, 60);

        let totals = sink.totals();
        assert_eq!(totals.collections, 1);
        assert_eq!(totals.swept_bytes, 40);
        assert_eq!(totals.finalized_objects, 1);
    }
}
