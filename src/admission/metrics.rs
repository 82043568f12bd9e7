//! # Admission Metrics
//!
//! Point-in-time snapshots of the limiter, queue and pool counters, for the
//! operations surface. Snapshots are plain data: take one, then inspect or
//! print it.
//!
//! ```text
//!     Snapshot flow:
//!
//!     component (atomics + locked state) ──stats()──► XxxStats ──► summary()
//! ```

use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Snapshot of a [`RateLimiterChain`](crate::RateLimiterChain).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LimiterStats {
    /// Chain name.
    pub name: String,

    /// Whether the chain is armed.
    pub running: bool,

    /// Whether the last armed check was rejected.
    pub throttled: bool,

    /// Number of windows in the chain.
    pub windows: usize,

    /// Events admitted while armed.
    pub total_admitted: u64,

    /// Events rejected while armed.
    pub total_rejected: u64,
}

impl LimiterStats {
    /// Fraction of armed checks that were admitted (1.0 when none ran).
    pub fn admit_rate(&self) -> f64 {
        let total = self.total_admitted + self.total_rejected;
        if total == 0 {
            1.0
        } else {
            self.total_admitted as f64 / total as f64
        }
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        format!(
            "Rate Limiter '{}':\n\
             ├─ Running: {} ({} windows)\n\
             ├─ Throttled: {}\n\
             ├─ Admitted: {}\n\
             ├─ Rejected: {}\n\
             └─ Admit Rate: {:.2}%",
            self.name,
            self.running,
            self.windows,
            self.throttled,
            self.total_admitted,
            self.total_rejected,
            self.admit_rate() * 100.0
        )
    }
}

impl fmt::Display for LimiterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Snapshot of a [`BoundedAlarmQueue`](crate::BoundedAlarmQueue).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct QueueStats {
    /// Queue name.
    pub name: String,

    /// Items currently queued.
    pub size: usize,

    /// Configured capacity.
    pub capacity: usize,

    /// Items accepted onto the queue.
    pub total_enqueued: u64,

    /// Items handed to consumers.
    pub total_dequeued: u64,

    /// Items discarded by the overflow policy.
    pub total_dropped: u64,

    /// Items discarded since the queue last reached capacity.
    pub dropped_since_last_overflow: u64,

    /// Threshold alarm is raised.
    pub above_threshold: bool,

    /// Max-size alarm is raised.
    pub at_capacity: bool,

    /// Mean size over the averaging window.
    pub average_size: f64,
}

impl QueueStats {
    /// Fraction of capacity in use; may exceed 1.0 under the unbounded policy.
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.size as f64 / self.capacity as f64
        }
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        format!(
            "Queue '{}':\n\
             ├─ Size: {}/{} ({:.1}%)\n\
             ├─ Average Size: {:.2}\n\
             ├─ Alarms: threshold={} capacity={}\n\
             └─ Lifetime:\n\
                ├─ Enqueued: {}\n\
                ├─ Dequeued: {}\n\
                └─ Dropped: {} ({} since last overflow)",
            self.name,
            self.size,
            self.capacity,
            self.fill_ratio() * 100.0,
            self.average_size,
            self.above_threshold,
            self.at_capacity,
            self.total_enqueued,
            self.total_dequeued,
            self.total_dropped,
            self.dropped_since_last_overflow
        )
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Snapshot of a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolStats {
    /// Pool name.
    pub name: String,

    /// Floor the reaper trims toward.
    pub min_workers: usize,

    /// Workers bound to a source.
    pub active_workers: usize,

    /// Workers parked on the idle stack.
    pub idle_workers: usize,

    /// `active_workers + idle_workers`.
    pub total_workers: usize,

    /// Worker threads created since startup.
    pub total_spawned: u64,

    /// Workers retired by the reaper or shutdown.
    pub total_reaped: u64,

    /// Work items that completed without error.
    pub total_processed: u64,

    /// Work items that returned an error or panicked.
    pub total_failed: u64,
}

impl PoolStats {
    /// Whether the pool holds more workers than its floor.
    pub fn has_surplus(&self) -> bool {
        self.total_workers > self.min_workers
    }

    /// Human-readable report.
    pub fn summary(&self) -> String {
        format!(
            "Worker Pool '{}':\n\
             ├─ Workers:\n\
             │  ├─ Active: {}\n\
             │  ├─ Idle: {}\n\
             │  ├─ Total: {} (min {})\n\
             │  └─ Spawned/Reaped: {}/{}\n\
             └─ Work Items:\n\
                ├─ Processed: {}\n\
                └─ Failed: {}",
            self.name,
            self.active_workers,
            self.idle_workers,
            self.total_workers,
            self.min_workers,
            self.total_spawned,
            self.total_reaped,
            self.total_processed,
            self.total_failed
        )
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Snapshot of a [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RegistryStats {
    /// Registered limiter chains.
    pub limiters: usize,

    /// Registered chains that are armed.
    pub running_limiters: usize,

    /// Registered queues, with or without a dispatcher.
    pub queues: usize,

    /// Registered queues drained by a worker pool.
    pub work_queues: usize,

    /// Listeners on the alarm fan-out.
    pub alarm_listeners: usize,
}

impl RegistryStats {
    /// Human-readable report.
    pub fn summary(&self) -> String {
        format!(
            "Admission Registry:\n\
             ├─ Limiters: {} ({} running)\n\
             ├─ Queues: {} ({} dispatched)\n\
             └─ Alarm Listeners: {}",
            self.limiters, self.running_limiters, self.queues, self.work_queues, self.alarm_listeners
        )
    }
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
