//! # Alarm Sinks
//!
//! Queues and limiter chains report state transitions outward through two
//! small traits. Implementations belong to an operations layer; the crate
//! only ships a no-op sink, a logging sink and a fan-out that forwards to
//! any number of listeners.
//!
//! ```text
//!     BoundedAlarmQueue ──► AlarmSink ──┬──► SNMP bridge
//!                           (fan-out)   ├──► metrics exporter
//!                                       └──► log
//! ```
//!
//! Sink calls are made on the producer or consumer thread after the queue
//! lock has been released, one at a time and in transition order. A sink may
//! read the queue that called it but must not enqueue, dequeue or change its
//! settings.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Receiver of queue alarms, keyed by queue name.
pub trait AlarmSink: Send + Sync {
    /// The queue size crossed its threshold from below.
    fn raise_threshold_exceeded(&self, queue: &str);

    /// A bounded queue reached its capacity.
    fn raise_max_size_exceeded(&self, queue: &str);

    /// A queue that was at capacity has room again.
    fn raise_queue_ok_again(&self, queue: &str);

    /// The queue size fell to the hysteresis lower bound.
    fn raise_queue_threshold_ok(&self, _queue: &str) {}

    /// A queue was created and starts reporting.
    fn register_queue(&self, queue: &str);

    /// A queue was closed and stops reporting.
    fn unregister_queue(&self, queue: &str);
}

/// Receiver of rate limiter throttle transitions, keyed by chain name.
pub trait ThrottleListener: Send + Sync {
    /// The chain started rejecting events.
    fn flow_exceeds_threshold(&self, limiter: &str);

    /// The chain admits events again after rejecting.
    fn flow_ok_again(&self, limiter: &str);
}

/// Sink that ignores every alarm.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlarmSink;

impl AlarmSink for NoopAlarmSink {
    fn raise_threshold_exceeded(&self, _queue: &str) {}
    fn raise_max_size_exceeded(&self, _queue: &str) {}
    fn raise_queue_ok_again(&self, _queue: &str) {}
    fn register_queue(&self, _queue: &str) {}
    fn unregister_queue(&self, _queue: &str) {}
}

/// Sink and throttle listener that writes every transition to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlarmSink;

impl AlarmSink for LoggingAlarmSink {
    fn raise_threshold_exceeded(&self, queue: &str) {
        warn!(queue, "queue threshold exceeded");
    }

    fn raise_max_size_exceeded(&self, queue: &str) {
        warn!(queue, "queue max size exceeded");
    }

    fn raise_queue_ok_again(&self, queue: &str) {
        info!(queue, "queue accepting again");
    }

    fn raise_queue_threshold_ok(&self, queue: &str) {
        info!(queue, "queue back under threshold");
    }

    fn register_queue(&self, queue: &str) {
        info!(queue, "queue registered");
    }

    fn unregister_queue(&self, queue: &str) {
        info!(queue, "queue unregistered");
    }
}

impl ThrottleListener for LoggingAlarmSink {
    fn flow_exceeds_threshold(&self, limiter: &str) {
        warn!(limiter, "throttle engaged");
    }

    fn flow_ok_again(&self, limiter: &str) {
        info!(limiter, "throttle released");
    }
}

/// Forwards every alarm to each registered listener in registration order.
///
/// ```rust
/// use admission::{AlarmFanout, AlarmSink, LoggingAlarmSink};
/// use std::sync::Arc;
///
/// let fanout = AlarmFanout::new();
/// fanout.add_listener(Arc::new(LoggingAlarmSink));
/// assert_eq!(fanout.listener_count(), 1);
/// fanout.raise_threshold_exceeded("REQUESTI");
/// ```
#[derive(Default)]
pub struct AlarmFanout {
    listeners: RwLock<Vec<Arc<dyn AlarmSink>>>,
}

impl AlarmFanout {
    /// Creates a fan-out with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener.
    pub fn add_listener(&self, listener: Arc<dyn AlarmSink>) {
        self.listeners.write().push(listener);
    }

    /// Removes a listener previously added, compared by pointer identity.
    ///
    /// Returns `true` if it was present.
    pub fn remove_listener(&self, listener: &Arc<dyn AlarmSink>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn for_each(&self, f: impl Fn(&dyn AlarmSink)) {
        // Snapshot so a listener may add or remove listeners re-entrantly.
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }
}

impl AlarmSink for AlarmFanout {
    fn raise_threshold_exceeded(&self, queue: &str) {
        self.for_each(|l| l.raise_threshold_exceeded(queue));
    }

    fn raise_max_size_exceeded(&self, queue: &str) {
        self.for_each(|l| l.raise_max_size_exceeded(queue));
    }

    fn raise_queue_ok_again(&self, queue: &str) {
        self.for_each(|l| l.raise_queue_ok_again(queue));
    }

    fn raise_queue_threshold_ok(&self, queue: &str) {
        self.for_each(|l| l.raise_queue_threshold_ok(queue));
    }

    fn register_queue(&self, queue: &str) {
        self.for_each(|l| l.register_queue(queue));
    }

    fn unregister_queue(&self, queue: &str) {
        self.for_each(|l| l.unregister_queue(queue));
    }
}

impl fmt::Debug for AlarmFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmFanout")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
