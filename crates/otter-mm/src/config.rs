//! GC configuration
//!
//! Knobs are loaded once when the [`Runtime`](crate::runtime::Runtime) is
//! built and are read-only afterwards. The heap growth controller keeps its
//! own copy of the target heap size and recomputes it after each collection.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Collector variant selected at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcKind {
    /// Never collects; scheduled epochs complete immediately
    NoOp,
    /// Mark and sweep with every mutator suspended for the whole collection
    #[default]
    StopTheWorld,
    /// Marks with mutators suspended, then resumes them and processes weak
    /// references and sweeps concurrently behind weak-reference barriers
    Concurrent,
}

impl FromStr for GcKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noop" | "none" => Ok(Self::NoOp),
            "stw" | "stms" | "stop-the-world" => Ok(Self::StopTheWorld),
            "cms" | "concurrent" => Ok(Self::Concurrent),
            other => Err(ConfigError::UnknownGcKind(other.to_string())),
        }
    }
}

/// Scheduler policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Heap growth controller plus a regular interval timer
    #[default]
    Adaptive,
    /// Collects at every newly seen safepoint site (debugging aid)
    Aggressive,
    /// Collects only on explicit request
    Manual,
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adaptive" => Ok(Self::Adaptive),
            "aggressive" => Ok(Self::Aggressive),
            "manual" => Ok(Self::Manual),
            other => Err(ConfigError::UnknownScheduler(other.to_string())),
        }
    }
}

/// Scheduler knobs
#[derive(Debug, Clone, PartialEq)]
pub struct GcSchedulerConfig {
    /// Heap size at which a collection is forced and mutators are paused
    pub target_heap_bytes: usize,
    /// Fraction of the target at which a collection is scheduled
    pub target_heap_soft_coefficient: f64,
    /// Desired ratio of alive bytes to the target heap size
    pub target_heap_utilization: f64,
    /// Lower clamp for the recomputed target
    pub min_heap_bytes: usize,
    /// Upper clamp for the recomputed target
    pub max_heap_bytes: usize,
    /// Recompute the target from the alive set after each collection
    pub auto_tune: bool,
    /// Period of the adaptive scheduler's timer
    pub regular_gc_interval: Duration,
}

impl Default for GcSchedulerConfig {
    fn default() -> Self {
        Self {
            target_heap_bytes: 100 * 1024 * 1024, // 100MB
            target_heap_soft_coefficient: 0.8,
            target_heap_utilization: 0.5,
            min_heap_bytes: 5 * 1024 * 1024, // 5MB
            max_heap_bytes: usize::MAX,
            auto_tune: true,
            regular_gc_interval: Duration::from_secs(10),
        }
    }
}

impl GcSchedulerConfig {
    /// Check the invariants the heap growth controller relies on
    pub fn validate(&self) -> Result<()> {
        check_ratio(
            "target_heap_soft_coefficient",
            self.target_heap_soft_coefficient,
        )?;
        check_ratio("target_heap_utilization", self.target_heap_utilization)?;
        if self.min_heap_bytes > self.max_heap_bytes {
            return Err(ConfigError::HeapBoundsInverted {
                min: self.min_heap_bytes,
                max: self.max_heap_bytes,
            });
        }
        if self.target_heap_bytes < self.min_heap_bytes
            || self.target_heap_bytes > self.max_heap_bytes
        {
            return Err(ConfigError::TargetOutOfBounds {
                target: self.target_heap_bytes,
                min: self.min_heap_bytes,
                max: self.max_heap_bytes,
            });
        }
        if self.regular_gc_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

fn check_ratio(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::RatioOutOfRange { name, value })
    }
}

/// Full memory manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Collector variant
    pub gc: GcKind,
    /// Scheduler policy
    pub scheduler: SchedulerKind,
    /// Scheduler knobs
    pub scheduler_config: GcSchedulerConfig,
    /// Longest time the collector waits on a `GcDelay` before starting anyway
    pub max_gc_delay: Duration,
    /// Start the finalizer thread when the runtime is built instead of lazily
    pub start_finalizer_thread: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc: GcKind::default(),
            scheduler: SchedulerKind::default(),
            scheduler_config: GcSchedulerConfig::default(),
            max_gc_delay: Duration::from_millis(50),
            start_finalizer_thread: false,
        }
    }
}

impl GcConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.scheduler_config.validate()
    }

    /// Load overrides from `OTTER_GC*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("OTTER_GC") {
            config.gc = value.parse()?;
        }
        if let Some(value) = lookup("OTTER_GC_SCHEDULER") {
            config.scheduler = value.parse()?;
        }

        let sc = &mut config.scheduler_config;
        if let Some(v) = parse_var(&lookup, "OTTER_GC_TARGET_HEAP_BYTES")? {
            sc.target_heap_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "OTTER_GC_TARGET_HEAP_SOFT_COEFFICIENT")? {
            sc.target_heap_soft_coefficient = v;
        }
        if let Some(v) = parse_var(&lookup, "OTTER_GC_TARGET_HEAP_UTILIZATION")? {
            sc.target_heap_utilization = v;
        }
        if let Some(v) = parse_var(&lookup, "OTTER_GC_MIN_HEAP_BYTES")? {
            sc.min_heap_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "OTTER_GC_MAX_HEAP_BYTES")? {
            sc.max_heap_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "OTTER_GC_AUTO_TUNE")? {
            sc.auto_tune = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "OTTER_GC_REGULAR_INTERVAL_MS")? {
            sc.regular_gc_interval = Duration::from_millis(ms);
        }
        if let Some(us) = parse_var::<u64, _>(&lookup, "OTTER_GC_MAX_DELAY_US")? {
            config.max_gc_delay = Duration::from_micros(us);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
