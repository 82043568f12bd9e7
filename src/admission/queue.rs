//! # Bounded Alarm Queue
//!
//! A FIFO buffer of opaque work items with a capacity, an overflow policy,
//! two edge-triggered alarms and a moving-average size estimator.
//!
//! ```text
//!     producers ──enqueue()──►┌───────────────────────────┐──dequeue()──► consumers
//!                             │ head ◄── A  B  C  D ◄── tail │
//!                             └───────────────────────────┘
//!                                        │ transitions
//!                                        ▼
//!                                    AlarmSink
//! ```
//!
//! ## Overflow
//!
//! | policy       | full queue, new item                     |
//! |--------------|------------------------------------------|
//! | `DropNewest` | new item discarded                       |
//! | `DropOldest` | head evicted, new item appended          |
//! | `Unbounded`  | appended; size grows past capacity       |
//!
//! Overflow is never reported to the producer as an error. It is counted,
//! logged, and surfaced through the max-size alarm.
//!
//! ## Alarms
//!
//! ```text
//!     size ▲
//!   cap 10 ┤·········●●······   max-size exceeded ─► ok again once below cap
//!    thr 8 ┤······●●·····●●··   threshold exceeded (fires once)
//!   low  7 ┤····●···········●   threshold ok (fires once, at or below low)
//!          └──────────────────► time
//! ```
//!
//! Each alarm is a flag that only flips on a crossing, so the sink sees one
//! call per transition no matter how many items arrive while the queue sits
//! above a line.
//!
//! Sink calls happen after the queue lock is released, but always in the
//! order the transitions happened: each batch of calls takes a ticket under
//! the queue lock and waits for its turn before delivering. A sink call that
//! panics is logged and skipped; the queue carries on.
//!
//! ## Average size
//!
//! Size samples are folded into at most `MAX_BUCKETS` time buckets spanning
//! the averaging window, so memory stays bounded at any operation rate while
//! every operation inside the window still counts.

use super::{
    alarm::{AlarmSink, NoopAlarmSink},
    config::{validate_hysteresis, validate_threshold, OverflowPolicy, QueueConfig},
    error::{ConfigError, WorkResult},
    metrics::QueueStats,
    utils::{current_time_ms, panic_message, secs_to_ms},
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Buckets the averaging window is split into.
const MAX_BUCKETS: u64 = 1024;

/// An opaque unit of work. The queue and pool never look inside it.
///
/// Closures returning [`WorkResult`] are work items:
///
/// ```rust
/// use admission::{WorkItem, WorkResult};
///
/// let item: Box<dyn WorkItem> = Box::new(|| -> WorkResult { Ok(()) });
/// assert!(item.process().is_ok());
/// ```
pub trait WorkItem: Send {
    /// Runs the item. An error is logged by the worker and goes no further.
    fn process(self: Box<Self>) -> WorkResult;
}

impl<F> WorkItem for F
where
    F: FnOnce() -> WorkResult + Send,
{
    fn process(self: Box<Self>) -> WorkResult {
        (*self)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmEvent {
    ThresholdExceeded,
    MaxSizeExceeded,
    OkAgain,
    ThresholdOk,
    Registered,
    Unregistered,
}

/// Sink calls produced under one hold of the queue lock.
struct Pending {
    ticket: u64,
    events: Vec<AlarmEvent>,
}

/// Size samples that fell into one slice of the averaging window.
#[derive(Debug, Clone, Copy)]
struct SizeBucket {
    start_ms: u64,
    sum: u64,
    count: u64,
}

struct QueueState {
    items: VecDeque<Box<dyn WorkItem>>,
    policy: OverflowPolicy,
    capacity: usize,
    threshold_fraction: f64,
    hysteresis_fraction: f64,
    threshold_count: usize,
    lower_bound: usize,
    above_threshold: bool,
    at_capacity: bool,
    average_window_ms: u64,
    samples: VecDeque<SizeBucket>,
    total_enqueued: u64,
    total_dequeued: u64,
    total_dropped: u64,
    dropped_since_last_overflow: u64,
    closed: bool,
    next_ticket: u64,
}

impl QueueState {
    fn from_config(config: &QueueConfig) -> Self {
        let mut state = Self {
            items: VecDeque::new(),
            policy: config.policy,
            capacity: config.capacity,
            threshold_fraction: config.threshold_fraction,
            hysteresis_fraction: config.hysteresis_fraction,
            threshold_count: 0,
            lower_bound: 0,
            above_threshold: false,
            at_capacity: false,
            average_window_ms: secs_to_ms(config.average_window_secs),
            samples: VecDeque::new(),
            total_enqueued: 0,
            total_dequeued: 0,
            total_dropped: 0,
            dropped_since_last_overflow: 0,
            closed: false,
            next_ticket: 0,
        };
        state.recompute_bounds();
        state
    }

    /// Converts the fractions into item counts.
    fn recompute_bounds(&mut self) {
        let capacity = self.capacity as f64;
        // Epsilon keeps 10 * 0.8 at 8 rather than 9 after rounding error.
        let threshold = (capacity * self.threshold_fraction - 1e-9).ceil().max(1.0) as usize;
        let lower = (capacity * (self.threshold_fraction - self.hysteresis_fraction) + 1e-9)
            .floor()
            .max(0.0) as usize;

        self.threshold_count = threshold;
        self.lower_bound = lower.min(threshold - 1);
    }

    fn is_full(&self) -> bool {
        self.policy.is_bounded() && self.items.len() >= self.capacity
    }

    /// Flips alarm flags on crossings and records the resulting sink calls.
    fn evaluate(&mut self, events: &mut Vec<AlarmEvent>) {
        let size = self.items.len();

        if !self.above_threshold && size >= self.threshold_count {
            self.above_threshold = true;
            events.push(AlarmEvent::ThresholdExceeded);
        } else if self.above_threshold && size <= self.lower_bound {
            self.above_threshold = false;
            events.push(AlarmEvent::ThresholdOk);
        }

        let full = self.policy.is_bounded() && size >= self.capacity;
        if full && !self.at_capacity {
            self.at_capacity = true;
            self.dropped_since_last_overflow = 0;
            events.push(AlarmEvent::MaxSizeExceeded);
        } else if !full && self.at_capacity {
            self.at_capacity = false;
            events.push(AlarmEvent::OkAgain);
        }
    }

    fn bucket_ms(&self) -> u64 {
        (self.average_window_ms / MAX_BUCKETS).max(1)
    }

    fn record_sample(&mut self, now_ms: u64) {
        let bucket_ms = self.bucket_ms();
        let start_ms = now_ms - now_ms % bucket_ms;
        let size = self.items.len() as u64;
        match self.samples.back_mut() {
            Some(bucket) if bucket.start_ms == start_ms => {
                bucket.sum += size;
                bucket.count += 1;
            }
            _ => self.samples.push_back(SizeBucket {
                start_ms,
                sum: size,
                count: 1,
            }),
        }
        self.prune_samples(now_ms);
    }

    /// Drops buckets that end before the averaging window begins.
    fn prune_samples(&mut self, now_ms: u64) {
        let oldest = now_ms.saturating_sub(self.average_window_ms);
        let bucket_ms = self.bucket_ms();
        while matches!(self.samples.front(), Some(bucket) if bucket.start_ms + bucket_ms <= oldest)
        {
            self.samples.pop_front();
        }
    }

    fn average_size(&mut self, now_ms: u64) -> f64 {
        self.prune_samples(now_ms);
        let (sum, count) = self
            .samples
            .iter()
            .fold((0, 0), |(sum, count), b| (sum + b.sum, count + b.count));
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Stamps the sink calls produced under this lock hold with a delivery
    /// ticket. `None` when there are none.
    fn pending(&mut self, events: Vec<AlarmEvent>) -> Option<Pending> {
        if events.is_empty() {
            return None;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        Some(Pending { ticket, events })
    }

    fn take(&mut self, events: &mut Vec<AlarmEvent>) -> Option<Box<dyn WorkItem>> {
        let item = self.items.pop_front()?;
        self.total_dequeued += 1;
        self.evaluate(events);
        self.record_sample(current_time_ms());
        Some(item)
    }
}

/// Bounded FIFO of [`WorkItem`]s with overflow policy and alarms.
///
/// # Example
///
/// ```rust
/// use admission::{BoundedAlarmQueue, OverflowPolicy, QueueConfig, WorkResult};
///
/// let queue = BoundedAlarmQueue::new(
///     QueueConfig::new("REQUESTI", 2).with_policy(OverflowPolicy::DropNewest),
/// )
/// .unwrap();
///
/// assert!(queue.push(|| -> WorkResult { Ok(()) }));
/// assert!(queue.push(|| -> WorkResult { Ok(()) }));
/// assert!(!queue.push(|| -> WorkResult { Ok(()) })); // full, discarded
/// assert_eq!(queue.size(), 2);
/// ```
pub struct BoundedAlarmQueue {
    name: String,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    sink: Arc<dyn AlarmSink>,
    /// Ticket of the next batch of sink calls allowed to run.
    delivered: Mutex<u64>,
    turn: Condvar,
}

impl BoundedAlarmQueue {
    /// Creates a queue that reports to no one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate.
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        Self::with_sink(config, Arc::new(NoopAlarmSink))
    }

    /// Creates a queue and registers it with `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate; the sink is
    /// not called in that case.
    pub fn with_sink(config: QueueConfig, sink: Arc<dyn AlarmSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let queue = Self {
            state: Mutex::new(QueueState::from_config(&config)),
            name: config.name,
            not_empty: Condvar::new(),
            sink,
            delivered: Mutex::new(0),
            turn: Condvar::new(),
        };
        queue.notify_sink(AlarmEvent::Registered);
        debug!(
            queue = %queue.name,
            capacity = config.capacity,
            policy = ?config.policy,
            "created alarm queue"
        );
        Ok(queue)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an item at the tail, applying the overflow policy when full.
    ///
    /// Returns `true` if `item` is now queued. Under `DropOldest` the
    /// evicted head is discarded instead, so this still returns `true`.
    /// A closed queue discards everything and returns `false`.
    pub fn enqueue(&self, item: Box<dyn WorkItem>) -> bool {
        let mut events = Vec::new();
        let mut discarded = Vec::new();

        let (accepted, pending) = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                debug!(queue = %self.name, "enqueue on closed queue discarded");
                return false;
            }

            let accepted = match (state.is_full(), state.policy) {
                (false, _) | (_, OverflowPolicy::Unbounded) => {
                    state.items.push_back(item);
                    true
                }
                (true, OverflowPolicy::DropNewest) => {
                    discarded.push(item);
                    false
                }
                (true, OverflowPolicy::DropOldest) => {
                    // Loops when a shrink left the queue above capacity.
                    while state.items.len() >= state.capacity {
                        match state.items.pop_front() {
                            Some(oldest) => discarded.push(oldest),
                            None => break,
                        }
                    }
                    state.items.push_back(item);
                    true
                }
            };

            if accepted {
                state.total_enqueued += 1;
            }
            if !discarded.is_empty() {
                let dropped = discarded.len() as u64;
                state.total_dropped += dropped;
                state.dropped_since_last_overflow += dropped;
                if state.dropped_since_last_overflow == dropped {
                    warn!(
                        queue = %self.name,
                        policy = ?state.policy,
                        capacity = state.capacity,
                        "queue overflow, discarding work"
                    );
                }
            }

            state.evaluate(&mut events);
            state.record_sample(current_time_ms());

            if accepted {
                self.not_empty.notify_one();
            }
            (accepted, state.pending(events))
        };

        self.deliver(pending);
        drop(discarded);
        accepted
    }

    /// Boxes `item` and enqueues it.
    pub fn push<W>(&self, item: W) -> bool
    where
        W: WorkItem + 'static,
    {
        self.enqueue(Box::new(item))
    }

    /// Removes the head item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been closed.
    pub fn dequeue(&self) -> Option<Box<dyn WorkItem>> {
        let mut events = Vec::new();
        let (item, pending) = {
            let mut state = self.state.lock();
            let item = loop {
                if let Some(item) = state.take(&mut events) {
                    break Some(item);
                }
                if state.closed {
                    break None;
                }
                self.not_empty.wait(&mut state);
            };
            (item, state.pending(events))
        };
        self.deliver(pending);
        item
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Box<dyn WorkItem>> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        let (item, pending) = {
            let mut state = self.state.lock();
            let item = loop {
                if let Some(item) = state.take(&mut events) {
                    break Some(item);
                }
                if state.closed || self.not_empty.wait_until(&mut state, deadline).timed_out() {
                    break state.take(&mut events);
                }
            };
            (item, state.pending(events))
        };
        self.deliver(pending);
        item
    }

    /// Removes the head item if there is one, without blocking.
    pub fn try_dequeue(&self) -> Option<Box<dyn WorkItem>> {
        let mut events = Vec::new();
        let (item, pending) = {
            let mut state = self.state.lock();
            let item = state.take(&mut events);
            (item, state.pending(events))
        };
        self.deliver(pending);
        item
    }

    /// Closes the queue: queued items are discarded, blocked consumers wake
    /// with `None`, and the queue is unregistered from its sink.
    ///
    /// Calling it again does nothing.
    pub fn close(&self) {
        let (discarded, pending) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.above_threshold = false;
            state.at_capacity = false;
            self.not_empty.notify_all();
            let pending = state.pending(vec![AlarmEvent::Unregistered]);
            (std::mem::take(&mut state.items), pending)
        };

        info!(queue = %self.name, discarded = discarded.len(), "closed alarm queue");
        self.deliver(pending);
        drop(discarded);
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Current overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.state.lock().policy
    }

    /// Switches the overflow policy; alarms are re-evaluated.
    pub fn set_policy(&self, policy: OverflowPolicy) {
        self.reconfigure(|state| state.policy = policy);
    }

    /// Current capacity.
    pub fn max_size(&self) -> usize {
        self.state.lock().capacity
    }

    /// Changes the capacity. Shrinking never discards queued items; the
    /// queue stays over capacity until consumers drain it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidCapacity`] for 0.
    pub fn set_max_size(&self, capacity: usize) -> Result<(), ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        self.reconfigure(|state| state.capacity = capacity);
        Ok(())
    }

    /// Threshold as a percentage of capacity.
    pub fn threshold_percent(&self) -> u32 {
        (self.state.lock().threshold_fraction * 100.0).round() as u32
    }

    /// Sets the threshold as a percentage of capacity (1 to 100).
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidThreshold`] outside `1..=100`, or
    /// [`ConfigError::InvalidHysteresis`] if the current hysteresis would
    /// no longer fit below the new threshold.
    pub fn set_threshold_percent(&self, percent: u32) -> Result<(), ConfigError> {
        self.set_threshold(f64::from(percent) / 100.0)
    }

    /// Threshold as a fraction of capacity.
    pub fn threshold(&self) -> f64 {
        self.state.lock().threshold_fraction
    }

    /// Sets the threshold as a fraction of capacity.
    ///
    /// # Errors
    ///
    /// As for [`set_threshold_percent`](Self::set_threshold_percent).
    pub fn set_threshold(&self, fraction: f64) -> Result<(), ConfigError> {
        validate_threshold(fraction)?;
        self.update(|state| {
            validate_hysteresis(state.hysteresis_fraction, fraction)?;
            state.threshold_fraction = fraction;
            Ok(())
        })
    }

    /// Gap between the threshold and the point where its alarm clears.
    pub fn hysteresis(&self) -> f64 {
        self.state.lock().hysteresis_fraction
    }

    /// Sets the hysteresis fraction.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidHysteresis`] unless `0 < fraction < threshold`.
    pub fn set_hysteresis(&self, fraction: f64) -> Result<(), ConfigError> {
        self.update(|state| {
            validate_hysteresis(fraction, state.threshold_fraction)?;
            state.hysteresis_fraction = fraction;
            Ok(())
        })
    }

    /// Item count at which the threshold alarm is raised.
    pub fn threshold_size(&self) -> usize {
        self.state.lock().threshold_count
    }

    /// Item count at or below which the threshold alarm clears.
    pub fn lower_threshold_size(&self) -> usize {
        self.state.lock().lower_bound
    }

    /// Averaging window in seconds.
    pub fn average_window_secs(&self) -> u64 {
        self.state.lock().average_window_ms / 1000
    }

    /// Sets the averaging window in seconds.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAverageWindow`] for 0.
    pub fn set_average_window_secs(&self, secs: u64) -> Result<(), ConfigError> {
        if secs == 0 {
            return Err(ConfigError::InvalidAverageWindow);
        }
        self.state.lock().average_window_ms = secs_to_ms(secs);
        Ok(())
    }

    /// Mean queue size sampled at every enqueue and dequeue over the
    /// averaging window, 0 if no samples remain.
    ///
    /// The window's edge is tracked to a 1/1024th of its length.
    pub fn average_size(&self) -> f64 {
        self.average_size_at(current_time_ms())
    }

    pub(crate) fn average_size_at(&self, now_ms: u64) -> f64 {
        self.state.lock().average_size(now_ms)
    }

    /// Whether the threshold alarm is currently raised.
    pub fn is_above_threshold(&self) -> bool {
        self.state.lock().above_threshold
    }

    /// Whether the max-size alarm is currently raised.
    pub fn is_at_capacity(&self) -> bool {
        self.state.lock().at_capacity
    }

    /// Items discarded since the queue last reached capacity.
    pub fn dropped_since_last_overflow(&self) -> u64 {
        self.state.lock().dropped_since_last_overflow
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        let average_size = self.average_size();
        let state = self.state.lock();
        QueueStats {
            name: self.name.clone(),
            size: state.items.len(),
            capacity: state.capacity,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            total_dropped: state.total_dropped,
            dropped_since_last_overflow: state.dropped_since_last_overflow,
            above_threshold: state.above_threshold,
            at_capacity: state.at_capacity,
            average_size,
        }
    }

    /// Applies a settings change, recomputes bounds and re-evaluates alarms.
    /// Nothing changes if `change` fails.
    fn update(
        &self,
        change: impl FnOnce(&mut QueueState) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        let pending = {
            let mut state = self.state.lock();
            change(&mut state)?;
            Self::settle(&mut state)
        };
        self.deliver(pending);
        Ok(())
    }

    /// [`update`](Self::update) for changes that cannot fail.
    fn reconfigure(&self, change: impl FnOnce(&mut QueueState)) {
        let pending = {
            let mut state = self.state.lock();
            change(&mut state);
            Self::settle(&mut state)
        };
        self.deliver(pending);
    }

    fn settle(state: &mut QueueState) -> Option<Pending> {
        state.recompute_bounds();
        let mut events = Vec::new();
        if !state.closed {
            state.evaluate(&mut events);
        }
        state.pending(events)
    }

    /// Waits for this batch's turn, then makes its sink calls.
    fn deliver(&self, pending: Option<Pending>) {
        let Some(pending) = pending else {
            return;
        };

        let mut delivered = self.delivered.lock();
        while *delivered != pending.ticket {
            self.turn.wait(&mut delivered);
        }
        for &event in &pending.events {
            self.notify_sink(event);
        }
        *delivered += 1;
        drop(delivered);
        self.turn.notify_all();
    }

    fn notify_sink(&self, event: AlarmEvent) {
        debug!(queue = %self.name, ?event, "queue alarm");
        let call = panic::catch_unwind(AssertUnwindSafe(|| match event {
            AlarmEvent::ThresholdExceeded => self.sink.raise_threshold_exceeded(&self.name),
            AlarmEvent::MaxSizeExceeded => self.sink.raise_max_size_exceeded(&self.name),
            AlarmEvent::OkAgain => self.sink.raise_queue_ok_again(&self.name),
            AlarmEvent::ThresholdOk => self.sink.raise_queue_threshold_ok(&self.name),
            AlarmEvent::Registered => self.sink.register_queue(&self.name),
            AlarmEvent::Unregistered => self.sink.unregister_queue(&self.name),
        }));
        if let Err(payload) = call {
            error!(
                queue = %self.name,
                ?event,
                panic = panic_message(payload.as_ref()),
                "alarm sink panicked"
            );
        }
    }
}

impl Drop for BoundedAlarmQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for BoundedAlarmQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedAlarmQueue")
            .field("name", &self.name)
            .field("size", &state.items.len())
            .field("capacity", &state.capacity)
            .field("policy", &state.policy)
            .field("closed", &state.closed)
            .finish()
    }
}
