//! # Work Queue Dispatch
//!
//! Couples a [`BoundedAlarmQueue`] to a [`WorkerPool`]. Producers enqueue;
//! whenever the queue has work and fewer than `max_workers` pool workers are
//! draining it, one more worker is assigned.
//!
//! ```text
//!     enqueue ──► BoundedAlarmQueue ──► claim slot? ──yes──► pool.assign(queue)
//!                                          │
//!                                          no: a bound worker will get to it
//! ```
//!
//! ## No Lost Wakeups
//!
//! A producer enqueues, then tries to claim a worker slot. A worker that
//! finds the queue empty first gives its slot back, then looks at the queue
//! again and reclaims a slot if an item slipped in. One of the two always
//! sees the other's write, so an enqueued item is never stranded with zero
//! workers bound.

use super::{
    error::{ConfigError, PoolError},
    metrics::QueueStats,
    pool::{WorkSource, WorkerPool},
    queue::{BoundedAlarmQueue, WorkItem},
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

struct Dispatch {
    queue: Arc<BoundedAlarmQueue>,
    pool: Arc<WorkerPool>,
    max_workers: AtomicUsize,
    active_workers: AtomicUsize,
}

impl Dispatch {
    fn try_claim(&self) -> bool {
        let max = self.max_workers.load(Ordering::SeqCst);
        self.active_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkSource for Dispatch {
    fn next_work(&self) -> Option<Box<dyn WorkItem>> {
        self.queue.try_dequeue()
    }

    fn exhausted(&self) -> bool {
        self.release();
        !self.queue.is_empty() && !self.queue.is_closed() && self.try_claim()
    }
}

/// A bounded alarm queue drained by at most `max_workers` pool workers.
///
/// Cloning is cheap and yields a handle to the same queue.
///
/// ```rust
/// use admission::{BoundedAlarmQueue, PoolConfig, QueueConfig, WorkQueue, WorkResult, WorkerPool};
/// use std::sync::{mpsc, Arc};
///
/// let pool = Arc::new(WorkerPool::new(PoolConfig::new("io", 2)).unwrap());
/// let queue = Arc::new(BoundedAlarmQueue::new(QueueConfig::new("REQUESTI", 100)).unwrap());
/// let work = WorkQueue::new(queue, pool, 4).unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// work.push(move || -> WorkResult {
///     tx.send("done").unwrap();
///     Ok(())
/// });
/// assert_eq!(rx.recv().unwrap(), "done");
/// ```
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Dispatch>,
}

impl WorkQueue {
    /// Creates a dispatcher for `queue` on `pool`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidPool`] if `max_workers` is 0.
    pub fn new(
        queue: Arc<BoundedAlarmQueue>,
        pool: Arc<WorkerPool>,
        max_workers: usize,
    ) -> Result<Self, ConfigError> {
        validate_max_workers(max_workers)?;
        Ok(Self {
            inner: Arc::new(Dispatch {
                queue,
                pool,
                max_workers: AtomicUsize::new(max_workers),
                active_workers: AtomicUsize::new(0),
            }),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        self.inner.queue.name()
    }

    /// Enqueues `item` and makes sure a worker is on its way.
    ///
    /// Returns what [`BoundedAlarmQueue::enqueue`] returns.
    pub fn enqueue(&self, item: Box<dyn WorkItem>) -> bool {
        let accepted = self.inner.queue.enqueue(item);
        self.dispatch();
        accepted
    }

    /// Boxes `item` and enqueues it.
    pub fn push<W>(&self, item: W) -> bool
    where
        W: WorkItem + 'static,
    {
        self.enqueue(Box::new(item))
    }

    /// The underlying queue, for its management surface.
    pub fn queue(&self) -> &Arc<BoundedAlarmQueue> {
        &self.inner.queue
    }

    /// The pool that drains this queue.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Most workers allowed to drain this queue at once.
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers.load(Ordering::SeqCst)
    }

    /// Changes the worker cap. Raising it puts idle capacity to work on any
    /// backlog right away; lowering it takes effect as workers release.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidPool`] for 0.
    pub fn set_max_workers(&self, max_workers: usize) -> Result<(), ConfigError> {
        validate_max_workers(max_workers)?;
        self.inner.max_workers.store(max_workers, Ordering::SeqCst);
        while !self.inner.queue.is_empty() && self.assign_one() {}
        Ok(())
    }

    /// Workers currently draining this queue.
    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    /// Closes the queue; queued items are discarded and bound workers
    /// release once they run dry.
    pub fn close(&self) {
        self.inner.queue.close();
    }

    /// Queue counter snapshot.
    pub fn stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    fn dispatch(&self) {
        if !self.inner.queue.is_empty() {
            self.assign_one();
        }
    }

    /// Claims a slot and assigns a worker; `false` if the cap is reached or
    /// the pool refused.
    fn assign_one(&self) -> bool {
        if !self.inner.try_claim() {
            return false;
        }
        let source: Arc<dyn WorkSource> = self.inner.clone();
        match self.inner.pool.assign(source) {
            Ok(()) => true,
            Err(err) => {
                self.inner.release();
                log_assign_failure(self.name(), &err);
                false
            }
        }
    }
}

fn validate_max_workers(max_workers: usize) -> Result<(), ConfigError> {
    if max_workers == 0 {
        return Err(ConfigError::InvalidPool("max_workers must be at least 1"));
    }
    Ok(())
}

fn log_assign_failure(queue: &str, err: &PoolError) {
    warn!(queue, error = %err, "could not assign a worker to queue");
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("queue", &self.inner.queue)
            .field("pool", &self.inner.pool.name())
            .field("max_workers", &self.max_workers())
            .field("active_workers", &self.active_workers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::config::{OverflowPolicy, PoolConfig, QueueConfig};
    use crate::admission::error::WorkResult;
    use std::sync::atomic::AtomicU64;
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn setup(capacity: usize, max_workers: usize) -> WorkQueue {
        let pool = Arc::new(
            WorkerPool::new(PoolConfig::new("dispatch", 2).with_reap_intervals(600_000, 600_000))
                .unwrap(),
        );
        let queue = Arc::new(
            BoundedAlarmQueue::new(
                QueueConfig::new("work", capacity).with_policy(OverflowPolicy::Unbounded),
            )
            .unwrap(),
        );
        WorkQueue::new(queue, pool, max_workers).unwrap()
    }

    #[test]
    fn test_rejects_zero_workers() {
        let work = setup(10, 1);
        assert!(WorkQueue::new(work.queue().clone(), work.pool().clone(), 0).is_err());
        assert!(work.set_max_workers(0).is_err());
        assert_eq!(work.max_workers(), 1);
    }

    #[test]
    fn test_all_items_processed() {
        let work = setup(100, 3);
        let done = Arc::new(AtomicU64::new(0));

        for _ in 0..500 {
            let done = Arc::clone(&done);
            work.push(move || -> WorkResult {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        wait_for("all items", || done.load(Ordering::SeqCst) == 500);
        wait_for("workers to release", || work.active_workers() == 0);
        assert!(work.queue().is_empty());
    }

    #[test]
    fn test_worker_cap_is_respected() {
        let work = setup(100, 2);
        let gate = Arc::new(Barrier::new(3));

        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            work.push(move || -> WorkResult {
                gate.wait();
                Ok(())
            });
        }

        wait_for("two items taken", || work.queue().size() == 2);
        assert_eq!(work.active_workers(), 2);
        assert_eq!(work.pool().active_count(), 2);

        // Two rounds through the gate drain all four items.
        gate.wait();
        gate.wait();
        wait_for("queue to drain", || work.queue().is_empty());
        wait_for("workers to release", || work.active_workers() == 0);
        wait_for("workers to idle", || work.pool().active_count() == 0);
    }

    #[test]
    fn test_raising_cap_drains_backlog() {
        let work = setup(100, 1);
        let gate = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicU64::new(0));

        {
            let gate = Arc::clone(&gate);
            work.push(move || -> WorkResult {
                gate.wait();
                Ok(())
            });
        }
        wait_for("first item taken", || work.queue().is_empty());

        for _ in 0..3 {
            let done = Arc::clone(&done);
            work.push(move || -> WorkResult {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(work.queue().size(), 3);

        work.set_max_workers(3).unwrap();
        wait_for("backlog", || done.load(Ordering::SeqCst) == 3);

        gate.wait();
        wait_for("workers to release", || work.active_workers() == 0);
    }

    #[test]
    fn test_concurrent_producers_never_strand_items() {
        let work = setup(10_000, 2);
        let done = Arc::new(AtomicU64::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let work = work.clone();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let done = Arc::clone(&done);
                        work.push(move || -> WorkResult {
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        wait_for("all items", || done.load(Ordering::SeqCst) == 800);
        wait_for("workers to release", || work.active_workers() == 0);
    }

    #[test]
    fn test_closed_queue_releases_workers() {
        let work = setup(10, 2);
        work.close();
        assert!(!work.push(|| -> WorkResult { Ok(()) }));
        assert_eq!(work.active_workers(), 0);
    }

    #[test]
    fn test_panicking_sink_does_not_strand_work() {
        struct OkAgainPanics;

        impl crate::admission::alarm::AlarmSink for OkAgainPanics {
            fn raise_threshold_exceeded(&self, _: &str) {}
            fn raise_max_size_exceeded(&self, _: &str) {}
            fn raise_queue_ok_again(&self, _: &str) {
                panic!("sink unavailable");
            }
            fn register_queue(&self, _: &str) {}
            fn unregister_queue(&self, _: &str) {}
        }

        let pool = Arc::new(
            WorkerPool::new(PoolConfig::new("sink", 1).with_reap_intervals(600_000, 600_000))
                .unwrap(),
        );
        let queue = Arc::new(
            BoundedAlarmQueue::with_sink(
                QueueConfig::new("one", 1).with_policy(OverflowPolicy::DropNewest),
                Arc::new(OkAgainPanics),
            )
            .unwrap(),
        );
        let work = WorkQueue::new(queue, pool, 1).unwrap();
        let done = Arc::new(AtomicU64::new(0));

        for round in 1..=3 {
            let counter = Arc::clone(&done);
            assert!(work.push(move || -> WorkResult {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            wait_for("item to run", || done.load(Ordering::SeqCst) == round);
            wait_for("slot to be released", || work.active_workers() == 0);
        }
        assert!(work.queue().is_empty());
    }
}
