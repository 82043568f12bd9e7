//! # Admission Module
//!
//! Internal implementation of the admission and dispatch layer, one file per
//! concern.
//!
//! ## Module Structure
//!
//! ```text
//!     admission/
//!     ├── mod.rs          (module organization)
//!     ├── config.rs       (window, queue and pool settings)
//!     ├── error.rs        (ConfigError, PoolError, WorkResult)
//!     ├── alarm.rs        (alarm sinks, throttle listeners, fan-out)
//!     ├── limiter.rs      (multi-window rate limiter chain)
//!     ├── queue.rs        (bounded alarm queue, WorkItem)
//!     ├── pool.rs         (elastic worker pool and reaper)
//!     ├── dispatch.rs     (queue drained by capped pool workers)
//!     ├── registry.rs     (named limiters and queues)
//!     ├── metrics.rs      (stats snapshots)
//!     └── utils.rs        (monotonic clock)
//! ```
//!
//! ## Flow
//!
//! ```text
//!     event ──► RateLimiterChain::check() ──rejected──► caller drops it
//!                      │ admitted
//!                      ▼
//!               WorkQueue::enqueue() ──► BoundedAlarmQueue ──► AlarmSink
//!                      │
//!                      ▼
//!               WorkerPool::assign() ──► worker threads ◄── reaper
//! ```

mod alarm;
mod config;
mod dispatch;
mod error;
mod limiter;
mod metrics;
mod pool;
mod queue;
mod registry;
mod utils;

/// Settings types and defaults
pub use config::{
    parse_windows, OverflowPolicy, PoolConfig, QueueConfig, ReapOrder, ReuseOrder, WindowSpec,
    DEFAULT_AVERAGE_WINDOW_SECS, DEFAULT_FAST_REAP_INTERVAL_MS, DEFAULT_HYSTERESIS_FRACTION,
    DEFAULT_MIN_WORKERS, DEFAULT_QUEUE_CAPACITY, DEFAULT_REAP_INTERVAL_MS,
    DEFAULT_THRESHOLD_FRACTION,
};

/// Error types
pub use error::{ConfigError, PoolError, WorkError, WorkResult};

/// Alarm and throttle notification
pub use alarm::{AlarmFanout, AlarmSink, LoggingAlarmSink, NoopAlarmSink, ThrottleListener};

/// Rate limiting
pub use limiter::RateLimiterChain;

/// Queueing
pub use queue::{BoundedAlarmQueue, WorkItem};

/// Worker pool
pub use pool::{BatchSource, WorkSource, WorkerPool};

/// Queue to pool dispatch
pub use dispatch::WorkQueue;

/// Named component lookup
pub use registry::Registry;

/// Stats snapshots
pub use metrics::{LimiterStats, PoolStats, QueueStats, RegistryStats};

/// Clock
pub use utils::current_time_ms;
