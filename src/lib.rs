//! # Admission - Admission Control and Work Dispatch
//!
//! The layer a signaling stack puts between its network readers and its
//! processing logic. It decides which events get in, buffers bursts of the
//! ones that do, and runs them on a pool of threads that grows under load and
//! shrinks back when idle.
//!
//! ## Components
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Network readers       │
//!                    └──────────┬──────────────┘
//!                               │ event
//!                    ┌──────────▼──────────────┐
//!                    │   RateLimiterChain      │  1s:5, 60:100 ...
//!                    │   check() ─► bool       │  atomic across windows
//!                    └──────────┬──────────────┘
//!                               │ admitted, wrapped as WorkItem
//!                    ┌──────────▼──────────────┐
//!                    │   BoundedAlarmQueue     │──► AlarmSink
//!                    │   DropOldest/Newest/    │    threshold, max size,
//!                    │   Unbounded             │    ok again
//!                    └──────────┬──────────────┘
//!                               │ WorkQueue assigns up to max_workers
//!                    ┌──────────▼──────────────┐
//!                    │   WorkerPool            │◄── reaper trims idle
//!                    │   min..N threads        │    surplus to min
//!                    └─────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ### Rate Limiting
//!
//! ```rust
//! use admission::RateLimiterChain;
//!
//! // 5 per second and 100 per minute, both enforced.
//! let chain = RateLimiterChain::parse("inbound", "1:5, 60:100").unwrap();
//! chain.start();
//!
//! if chain.check() {
//!     // process the event
//! } else {
//!     // reject it
//! }
//! ```
//!
//! ### Queue and Pool
//!
//! ```rust
//! use admission::{OverflowPolicy, PoolBuilder, QueueBuilder, WorkQueue, WorkResult};
//! use std::sync::{mpsc, Arc};
//!
//! let pool = Arc::new(PoolBuilder::new("io").min_workers(2).build().unwrap());
//! let queue = Arc::new(
//!     QueueBuilder::new("REQUESTI")
//!         .capacity(1000)
//!         .policy(OverflowPolicy::DropOldest)
//!         .threshold_percent(80)
//!         .build()
//!         .unwrap(),
//! );
//! let work = WorkQueue::new(queue, pool, 4).unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! work.push(move || -> WorkResult {
//!     tx.send("handled")?;
//!     Ok(())
//! });
//! assert_eq!(rx.recv().unwrap(), "handled");
//! ```
//!
//! ## Failure Model
//!
//! - Bad settings fail fast with [`ConfigError`].
//! - Overflow is policy, never an error to the producer; it is counted,
//!   logged and reported to the [`AlarmSink`].
//! - A work item that returns an error or panics is logged and counted; its
//!   worker carries on.
//!
//! ## Logging
//!
//! Everything is reported through `tracing`. The library installs no
//! subscriber.
//!
//! ## Thread Safety
//!
//! All public types are `Send + Sync` and meant to be shared via `Arc`:
//! - `RateLimiterChain` serializes each check under one lock per chain
//! - `BoundedAlarmQueue` guards its items and alarm flags under one lock
//! - `WorkerPool` keeps a structural lock plus one private lock per worker

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

// Internal module
mod admission;

// Public re-exports
pub use admission::{
    current_time_ms, parse_windows, AlarmFanout, AlarmSink, BatchSource, BoundedAlarmQueue,
    ConfigError, LimiterStats, LoggingAlarmSink, NoopAlarmSink, OverflowPolicy, PoolConfig,
    PoolError, PoolStats, QueueConfig, QueueStats, RateLimiterChain, ReapOrder, Registry,
    RegistryStats, ReuseOrder, ThrottleListener, WindowSpec, WorkError, WorkItem, WorkQueue,
    WorkResult, WorkSource, WorkerPool, DEFAULT_AVERAGE_WINDOW_SECS,
    DEFAULT_FAST_REAP_INTERVAL_MS, DEFAULT_HYSTERESIS_FRACTION, DEFAULT_MIN_WORKERS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REAP_INTERVAL_MS, DEFAULT_THRESHOLD_FRACTION,
};

use std::fmt;
use std::sync::Arc;

/// A limiter chain wrapped in `Arc` for sharing across threads.
pub type SharedLimiter = Arc<RateLimiterChain>;

/// A queue wrapped in `Arc` for sharing between producers and consumers.
pub type SharedQueue = Arc<BoundedAlarmQueue>;

/// A worker pool wrapped in `Arc`, as [`WorkQueue`] expects it.
pub type SharedPool = Arc<WorkerPool>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use admission::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for wiring a limiter, queue and pool together.
    //!
    //! # Example
    //! ```rust
    //! use admission::prelude::*;
    //!
    //! let chain = RateLimiterChain::new("l", &[WindowSpec::per_second(10)]).unwrap();
    //! let config = QueueConfig::new("q", 100).with_policy(OverflowPolicy::DropOldest);
    //! let queue = BoundedAlarmQueue::new(config).unwrap();
    //! # let _ = (chain, queue);
    //! ```

    pub use crate::{
        AlarmSink, BoundedAlarmQueue, ConfigError, OverflowPolicy, PoolBuilder, PoolConfig,
        PoolError, QueueBuilder, QueueConfig, RateLimiterChain, Registry, SharedLimiter,
        SharedPool, SharedQueue, ThrottleListener, WindowSpec, WorkItem, WorkQueue, WorkResult,
        WorkerPool,
    };
}

/// Fluent construction of a [`BoundedAlarmQueue`].
///
/// # Example
///
/// ```rust
/// use admission::{OverflowPolicy, QueueBuilder};
///
/// let queue = QueueBuilder::new("REQUESTI")
///     .capacity(500)
///     .policy(OverflowPolicy::DropNewest)
///     .threshold_percent(90)
///     .build()
///     .unwrap();
/// assert_eq!(queue.threshold_size(), 450);
///
/// assert!(QueueBuilder::new("bad").capacity(0).build().is_err());
/// ```
pub struct QueueBuilder {
    config: QueueConfig,
    sink: Option<Arc<dyn AlarmSink>>,
}

impl QueueBuilder {
    /// Starts from the default queue settings under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: QueueConfig::new(name, DEFAULT_QUEUE_CAPACITY),
            sink: None,
        }
    }

    /// Sets the capacity (must be > 0).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Sets the overflow policy.
    pub fn policy(mut self, policy: OverflowPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Sets the threshold as a percentage of capacity.
    pub fn threshold_percent(mut self, percent: u32) -> Self {
        self.config.threshold_fraction = f64::from(percent) / 100.0;
        self
    }

    /// Sets the hysteresis fraction.
    pub fn hysteresis(mut self, fraction: f64) -> Self {
        self.config.hysteresis_fraction = fraction;
        self
    }

    /// Sets the averaging window in seconds.
    pub fn average_window_secs(mut self, secs: u64) -> Self {
        self.config.average_window_secs = secs;
        self
    }

    /// Sets the sink alarms are reported to.
    pub fn sink(mut self, sink: Arc<dyn AlarmSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the queue.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the settings are invalid.
    pub fn build(self) -> Result<BoundedAlarmQueue, ConfigError> {
        match self.sink {
            Some(sink) => BoundedAlarmQueue::with_sink(self.config, sink),
            None => BoundedAlarmQueue::new(self.config),
        }
    }
}

impl fmt::Debug for QueueBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBuilder")
            .field("config", &self.config)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Fluent construction of a [`WorkerPool`].
///
/// # Example
///
/// ```rust
/// use admission::{PoolBuilder, ReuseOrder};
///
/// let pool = PoolBuilder::new("io")
///     .min_workers(4)
///     .reap_interval_ms(30_000)
///     .fast_reap_interval_ms(5_000)
///     .reuse_order(ReuseOrder::Lifo)
///     .build()
///     .unwrap();
/// assert_eq!(pool.min_size(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Starts from the default pool settings under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(name, DEFAULT_MIN_WORKERS),
        }
    }

    /// Sets the worker floor (must be >= 1).
    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.config.min_workers = min_workers;
        self
    }

    /// Sets the reaper period while at the floor.
    pub fn reap_interval_ms(mut self, ms: u64) -> Self {
        self.config.reap_interval_ms = ms;
        self
    }

    /// Sets the reaper period while trimming surplus.
    pub fn fast_reap_interval_ms(mut self, ms: u64) -> Self {
        self.config.fast_reap_interval_ms = ms;
        self
    }

    /// Sets which idle worker takes new work.
    pub fn reuse_order(mut self, order: ReuseOrder) -> Self {
        self.config.reuse_order = order;
        self
    }

    /// Sets which idle worker the reaper retires.
    pub fn reap_order(mut self, order: ReapOrder) -> Self {
        self.config.reap_order = order;
        self
    }

    /// Builds the pool and starts its workers and reaper.
    ///
    /// # Errors
    ///
    /// [`PoolError::Config`] for invalid settings, [`PoolError::Spawn`] if a
    /// thread could not be started.
    pub fn build(self) -> Result<WorkerPool, PoolError> {
        WorkerPool::new(self.config)
    }
}
