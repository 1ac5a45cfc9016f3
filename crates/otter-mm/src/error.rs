//! Memory manager errors
//!
//! Only configuration loading and runtime startup are recoverable. Protocol
//! violations and allocation failure after a forced collection are fatal and
//! reported through panics/aborts.

use thiserror::Error;

/// Errors produced while building a [`GcConfig`](crate::config::GcConfig)
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Unknown collector variant name
    #[error("Unknown GC kind: {0}")]
    UnknownGcKind(String),

    /// Unknown scheduler variant name
    #[error("Unknown GC scheduler: {0}")]
    UnknownScheduler(String),

    /// A variable could not be parsed as the expected type
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
    },

    /// A ratio outside of (0, 1]
    #[error("{name} must be in (0, 1], got {value}")]
    RatioOutOfRange {
        /// Knob name
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// `min_heap_bytes > max_heap_bytes`
    #[error("min_heap_bytes ({min}) exceeds max_heap_bytes ({max})")]
    HeapBoundsInverted {
        /// Lower bound
        min: usize,
        /// Upper bound
        max: usize,
    },

    /// Target heap size outside of the configured bounds
    #[error("target_heap_bytes ({target}) is outside [{min}, {max}]")]
    TargetOutOfBounds {
        /// Target heap size
        target: usize,
        /// Lower bound
        min: usize,
        /// Upper bound
        max: usize,
    },

    /// Zero regular collection interval
    #[error("regular_gc_interval must be non-zero")]
    ZeroInterval,

    /// A runtime thread could not be started
    #[error("Failed to spawn {name} thread: {message}")]
    ThreadSpawn {
        /// Thread name
        name: &'static str,
        /// OS error
        message: String,
    },
}

/// Result type for configuration and startup
pub type Result<T> = std::result::Result<T, ConfigError>;
