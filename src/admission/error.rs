//! # Error Types
//!
//! Configuration problems fail fast with [`ConfigError`] at construction or
//! reconfiguration time. Overflow is never an error: it is policy and is
//! reported through the alarm sink. Work item failures are caught at the
//! worker boundary and only logged.

use std::io;

/// Error type returned by a failing [`WorkItem`](crate::WorkItem).
pub type WorkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of processing one work item.
pub type WorkResult = Result<(), WorkError>;

/// Invalid configuration supplied to a limiter chain, queue or pool.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A rate window has a zero or negative interval or allowance.
    #[error("rate window values must be positive (interval={interval}, allowance={allowance})")]
    NonPositiveWindow {
        /// Supplied interval in seconds.
        interval: i64,
        /// Supplied allowance per interval.
        allowance: i64,
    },

    /// A rate window entry is not an `interval:allowance` pair.
    #[error("rate window entries must be pairs of two, got {0:?}")]
    MalformedWindow(String),

    /// A limiter chain needs at least one window.
    #[error("a rate limiter chain needs at least one window")]
    EmptyWindows,

    /// The chain must be stopped before its windows are replaced.
    #[error("rate limiter chain '{0}' must be stopped before reconfiguring")]
    LimiterRunning(String),

    /// Queue capacity must be positive.
    #[error("queue capacity must be greater than 0")]
    InvalidCapacity,

    /// Threshold must be a fraction in `(0, 1]` or a percentage in `1..=100`.
    #[error("queue threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    /// Hysteresis must be positive and below the threshold.
    #[error("queue hysteresis {hysteresis} must be in (0, threshold {threshold})")]
    InvalidHysteresis {
        /// Supplied hysteresis fraction.
        hysteresis: f64,
        /// Threshold fraction it was checked against.
        threshold: f64,
    },

    /// The averaging window must span at least one second.
    #[error("average window must be at least 1 second")]
    InvalidAverageWindow,

    /// Pool settings are inconsistent.
    #[error("invalid pool configuration: {0}")]
    InvalidPool(&'static str),

    /// No queue is registered under this name.
    #[error("no queue named '{0}'")]
    UnknownQueue(String),

    /// No rate limiter chain is registered under this name.
    #[error("no rate limiter named '{0}'")]
    UnknownLimiter(String),
}

/// Failure to hand work to the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool has been shut down and accepts no more assignments.
    #[error("worker pool '{0}' is shut down")]
    ShutDown(String),

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// The pool configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
