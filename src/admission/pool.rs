//! # Elastic Worker Pool
//!
//! A set of worker threads that grows when work is assigned faster than
//! workers free up, and a reaper thread that trims idle surplus back toward
//! a configured floor.
//!
//! ## Architecture
//!
//! ```text
//!                       structural lock
//!     ┌──────────────────────────────────────────────────┐
//!     │ idle: [W3, W1, W4]  (tail = most recently idled) │
//!     │ active: 2   total: 5                              │
//!     └──────────────────────────────────────────────────┘
//!          ▲ push self          │ pop              │ pop surplus
//!          │ (going idle)       ▼ assign()         ▼ reaper
//!     ┌─────────┐          ┌─────────┐        ┌─────────┐
//!     │ Worker  │          │ Worker  │        │ Worker  │
//!     │ slot ◄──┼─ own     │ slot ◄──┼─ bind  │ slot ◄──┼─ Dying
//!     │ condvar │  lock    │ condvar │  +wake │ condvar │  +wake
//!     └─────────┘          └─────────┘        └─────────┘
//! ```
//!
//! Every worker owns a private slot and condition variable. Handing a worker
//! new work, or telling it to die, wakes exactly that worker.
//!
//! ## Worker Lifecycle
//!
//! ```text
//!     Idle ──assign──► Assigned ──► Processing ──source exhausted──► Idle
//!       │                                 │
//!       └──reaper / shutdown──► Dying ◄───┘ (pool shut down while busy)
//! ```
//!
//! ## Locking
//!
//! A worker going idle holds its own slot lock, then takes the structural
//! lock to push itself onto the idle stack. Nothing else takes both locks at
//! once: `assign` and the reaper pop a worker under the structural lock,
//! release it, and only then lock the worker's slot.
//!
//! ## Reaper
//!
//! The reaper wakes every `reap_interval_ms`. When it finds more idle workers
//! than `min_workers` it retires one and switches to `fast_reap_interval_ms`
//! until the surplus is gone.

use super::{
    config::{PoolConfig, ReapOrder, ReuseOrder},
    error::PoolError,
    metrics::PoolStats,
    queue::WorkItem,
    utils::panic_message,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Something a worker drains once it is assigned.
///
/// `next_work` must not block: returning `None` tells the worker the source
/// has nothing more right now.
pub trait WorkSource: Send + Sync {
    /// Next item to process, or `None` if none is immediately available.
    fn next_work(&self) -> Option<Box<dyn WorkItem>>;

    /// Called once `next_work` returned `None`, before the worker goes idle.
    ///
    /// Return `true` to keep the worker bound and poll again.
    fn exhausted(&self) -> bool {
        false
    }
}

/// A fixed batch of work items, drained in order.
pub struct BatchSource {
    items: Mutex<VecDeque<Box<dyn WorkItem>>>,
}

impl BatchSource {
    /// Wraps a list of items.
    pub fn new(items: impl IntoIterator<Item = Box<dyn WorkItem>>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Wraps one item.
    pub fn single(item: Box<dyn WorkItem>) -> Self {
        Self::new(std::iter::once(item))
    }

    /// Items not yet handed out.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether every item has been handed out.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl WorkSource for BatchSource {
    fn next_work(&self) -> Option<Box<dyn WorkItem>> {
        self.items.lock().pop_front()
    }
}

impl fmt::Debug for BatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSource")
            .field("remaining", &self.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Assigned,
    Processing,
    Dying,
}

struct Slot {
    source: Option<Arc<dyn WorkSource>>,
    state: WorkerState,
}

struct Worker {
    id: usize,
    slot: Mutex<Slot>,
    wake: Condvar,
}

impl Worker {
    fn new(id: usize, source: Option<Arc<dyn WorkSource>>) -> Self {
        let state = if source.is_some() {
            WorkerState::Assigned
        } else {
            WorkerState::Idle
        };
        Self {
            id,
            slot: Mutex::new(Slot { source, state }),
            wake: Condvar::new(),
        }
    }

    /// Binds a source to a worker just popped off the idle stack.
    fn bind(&self, source: Arc<dyn WorkSource>) {
        let mut slot = self.slot.lock();
        slot.source = Some(source);
        slot.state = WorkerState::Assigned;
        self.wake.notify_one();
    }

    /// Tells a worker just popped off the idle stack to exit.
    fn retire(&self) {
        let mut slot = self.slot.lock();
        slot.state = WorkerState::Dying;
        self.wake.notify_one();
    }

    fn run(self: Arc<Self>, shared: Arc<PoolShared>) {
        let mut slot = self.slot.lock();
        loop {
            match slot.state {
                WorkerState::Dying => break,
                WorkerState::Assigned => {
                    slot.state = WorkerState::Processing;
                    let source = slot.source.take();

                    MutexGuard::unlocked(&mut slot, || {
                        if let Some(source) = source {
                            shared.drain(self.id, source.as_ref());
                        }
                    });

                    shared.park(&self, &mut slot);
                }
                WorkerState::Idle | WorkerState::Processing => self.wake.wait(&mut slot),
            }
        }
        drop(slot);
        debug!(pool = %shared.config.name, worker = self.id, "worker exiting");
    }
}

struct PoolStructure {
    idle: VecDeque<Arc<Worker>>,
    active: usize,
    total: usize,
    shutdown: bool,
}

struct PoolShared {
    config: PoolConfig,
    structure: Mutex<PoolStructure>,
    next_worker_id: AtomicUsize,
    total_spawned: AtomicU64,
    total_reaped: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

impl PoolShared {
    fn spawn_worker(
        self: &Arc<Self>,
        source: Option<Arc<dyn WorkSource>>,
    ) -> io::Result<Arc<Worker>> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Worker::new(id, source));

        let thread_worker = Arc::clone(&worker);
        let thread_shared = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-worker-{}", self.config.name, id))
            .spawn(move || thread_worker.run(thread_shared))?;

        self.total_spawned.fetch_add(1, Ordering::Relaxed);
        debug!(pool = %self.config.name, worker = id, "spawned worker");
        Ok(worker)
    }

    /// Runs every item the source yields until it is exhausted.
    /// Drains `source` until it runs dry and `exhausted` lets the worker go.
    ///
    /// `exhausted` is reached after every pass, even one cut short by a
    /// panicking source, so a source that tracks bound workers always hears
    /// about the release.
    fn drain(&self, worker: usize, source: &dyn WorkSource) {
        loop {
            let pass = panic::catch_unwind(AssertUnwindSafe(|| {
                while let Some(item) = source.next_work() {
                    self.process(worker, item);
                }
            }));
            if let Err(payload) = pass {
                error!(
                    pool = %self.config.name,
                    worker,
                    panic = panic_message(payload.as_ref()),
                    "work source panicked"
                );
            }

            match panic::catch_unwind(AssertUnwindSafe(|| source.exhausted())) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(payload) => {
                    error!(
                        pool = %self.config.name,
                        worker,
                        panic = panic_message(payload.as_ref()),
                        "work source panicked while releasing"
                    );
                    break;
                }
            }
        }
    }

    fn process(&self, worker: usize, item: Box<dyn WorkItem>) {
        match panic::catch_unwind(AssertUnwindSafe(|| item.process())) {
            Ok(Ok(())) => {
                self.total_processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.config.name, worker, error = %err, "work item failed");
            }
            Err(payload) => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    pool = %self.config.name,
                    worker,
                    panic = panic_message(payload.as_ref()),
                    "work item panicked"
                );
            }
        }
    }

    /// Returns a worker whose source ran dry to the idle stack, or marks it
    /// dying if the pool was shut down meanwhile. Called with its slot held.
    fn park(&self, worker: &Arc<Worker>, slot: &mut Slot) {
        let mut structure = self.structure.lock();
        structure.active -= 1;
        if structure.shutdown {
            structure.total -= 1;
            slot.state = WorkerState::Dying;
            self.total_reaped.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.state = WorkerState::Idle;
            structure.idle.push_back(Arc::clone(worker));
        }
    }

    /// Retires one idle worker if there are more than `min_workers`.
    ///
    /// Returns `true` if a worker was retired.
    fn reap_one(&self) -> bool {
        let victim = {
            let mut structure = self.structure.lock();
            if structure.shutdown || structure.idle.len() <= self.config.min_workers {
                return false;
            }
            let victim = match self.config.reap_order {
                ReapOrder::MostRecent => structure.idle.pop_back(),
                ReapOrder::LeastRecent => structure.idle.pop_front(),
            };
            if victim.is_some() {
                structure.total -= 1;
            }
            victim
        };

        match victim {
            Some(worker) => {
                worker.retire();
                self.total_reaped.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.config.name, worker = worker.id, "reaped idle worker");
                true
            }
            None => false,
        }
    }

    /// Marks the pool shut down and retires every idle worker.
    ///
    /// Returns `false` if it was already shut down.
    fn close(&self) -> bool {
        let idle = {
            let mut structure = self.structure.lock();
            if structure.shutdown {
                return false;
            }
            structure.shutdown = true;
            structure.total -= structure.idle.len();
            std::mem::take(&mut structure.idle)
        };

        for worker in &idle {
            worker.retire();
        }
        self.total_reaped
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        true
    }
}

struct Reaper {
    handle: thread::JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

fn start_reaper(shared: Arc<PoolShared>) -> io::Result<Reaper> {
    let (stop_tx, stop_rx) = mpsc::channel();
    let name = format!("{}-reaper", shared.config.name);

    let handle = thread::Builder::new().name(name).spawn(move || {
        let normal = Duration::from_millis(shared.config.reap_interval_ms);
        let fast = Duration::from_millis(shared.config.fast_reap_interval_ms);
        let mut interval = normal;

        info!(
            "Started reaper for pool '{}' (interval: {}ms, fast: {}ms, min workers: {})",
            shared.config.name,
            shared.config.reap_interval_ms,
            shared.config.fast_reap_interval_ms,
            shared.config.min_workers
        );

        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("Reaper for pool '{}' stopping", shared.config.name);
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    interval = match panic::catch_unwind(AssertUnwindSafe(|| shared.reap_one())) {
                        Ok(true) => fast,
                        Ok(false) => normal,
                        Err(payload) => {
                            error!(
                                pool = %shared.config.name,
                                panic = panic_message(payload.as_ref()),
                                "reaper pass panicked"
                            );
                            normal
                        }
                    };
                }
            }
        }
    })?;

    Ok(Reaper { handle, stop_tx })
}

/// Elastic pool of worker threads with a background reaper.
///
/// # Example
///
/// ```rust
/// use admission::{PoolConfig, WorkResult, WorkerPool};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(PoolConfig::new("io", 2)).unwrap();
/// assert_eq!(pool.total_count(), 2);
///
/// let (tx, rx) = mpsc::channel();
/// pool.execute(Box::new(move || -> WorkResult {
///     tx.send(42).unwrap();
///     Ok(())
/// }))
/// .unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<Reaper>>,
}

impl WorkerPool {
    /// Creates a pool with `min_workers` idle workers and starts its reaper.
    ///
    /// # Errors
    ///
    /// [`PoolError::Config`] for an invalid configuration, or
    /// [`PoolError::Spawn`] if a thread could not be created. Workers spawned
    /// before the failure are retired.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let min_workers = config.min_workers;
        let shared = Arc::new(PoolShared {
            structure: Mutex::new(PoolStructure {
                idle: VecDeque::with_capacity(min_workers),
                active: 0,
                total: 0,
                shutdown: false,
            }),
            config,
            next_worker_id: AtomicUsize::new(0),
            total_spawned: AtomicU64::new(0),
            total_reaped: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        });

        let started = (0..min_workers)
            .try_for_each(|_| {
                let worker = shared.spawn_worker(None)?;
                let mut structure = shared.structure.lock();
                structure.total += 1;
                structure.idle.push_back(worker);
                Ok::<(), io::Error>(())
            })
            .and_then(|()| start_reaper(Arc::clone(&shared)));

        let reaper = match started {
            Ok(reaper) => reaper,
            Err(err) => {
                shared.close();
                return Err(PoolError::Spawn(err));
            }
        };

        info!(
            "Created worker pool '{}' with {} workers",
            shared.config.name, min_workers
        );

        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Hands `source` to an idle worker, spawning one if none is idle.
    ///
    /// The worker drains the source and then goes back to the idle stack.
    ///
    /// # Errors
    ///
    /// [`PoolError::ShutDown`] after [`shutdown`](Self::shutdown), or
    /// [`PoolError::Spawn`] if a new thread was needed and could not be
    /// created. Pool counts are unchanged on error.
    pub fn assign(&self, source: Arc<dyn WorkSource>) -> Result<(), PoolError> {
        let idle = {
            let mut structure = self.shared.structure.lock();
            if structure.shutdown {
                return Err(PoolError::ShutDown(self.shared.config.name.clone()));
            }
            structure.active += 1;
            let idle = match self.shared.config.reuse_order {
                ReuseOrder::Lifo => structure.idle.pop_back(),
                ReuseOrder::Fifo => structure.idle.pop_front(),
            };
            if idle.is_none() {
                structure.total += 1;
            }
            idle
        };

        match idle {
            Some(worker) => {
                worker.bind(source);
                Ok(())
            }
            None => match self.shared.spawn_worker(Some(source)) {
                Ok(_) => Ok(()),
                Err(err) => {
                    let mut structure = self.shared.structure.lock();
                    structure.active -= 1;
                    structure.total -= 1;
                    drop(structure);
                    warn!(pool = %self.shared.config.name, error = %err, "failed to grow pool");
                    Err(PoolError::Spawn(err))
                }
            },
        }
    }

    /// Runs a single item on a pool worker.
    ///
    /// # Errors
    ///
    /// As for [`assign`](Self::assign).
    pub fn execute(&self, item: Box<dyn WorkItem>) -> Result<(), PoolError> {
        self.assign(Arc::new(BatchSource::single(item)))
    }

    /// Stops the reaper and retires every idle worker. Busy workers finish
    /// their current source and then exit instead of going idle.
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn shutdown(&self) {
        if !self.shared.close() {
            return;
        }

        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            let _ = reaper.stop_tx.send(());
            if reaper.handle.join().is_err() {
                warn!(pool = %self.shared.config.name, "reaper thread panicked");
            }
        }

        info!("Worker pool '{}' shut down", self.shared.config.name);
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.structure.lock().shutdown
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Workers currently bound to a source.
    pub fn active_count(&self) -> usize {
        self.shared.structure.lock().active
    }

    /// Workers parked on the idle stack.
    pub fn idle_count(&self) -> usize {
        self.shared.structure.lock().idle.len()
    }

    /// Live workers, active plus idle.
    pub fn total_count(&self) -> usize {
        self.shared.structure.lock().total
    }

    /// Floor the reaper trims toward.
    pub fn min_size(&self) -> usize {
        self.shared.config.min_workers
    }

    /// One reaper pass, outside the reaper's schedule.
    pub(crate) fn reap_once(&self) -> bool {
        self.shared.reap_one()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let (active, idle, total) = {
            let structure = self.shared.structure.lock();
            (structure.active, structure.idle.len(), structure.total)
        };
        PoolStats {
            name: self.shared.config.name.clone(),
            min_workers: self.shared.config.min_workers,
            active_workers: active,
            idle_workers: idle,
            total_workers: total,
            total_spawned: self.shared.total_spawned.load(Ordering::Relaxed),
            total_reaped: self.shared.total_reaped.load(Ordering::Relaxed),
            total_processed: self.shared.total_processed.load(Ordering::Relaxed),
            total_failed: self.shared.total_failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let structure = self.shared.structure.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("min_workers", &self.shared.config.min_workers)
            .field("active", &structure.active)
            .field("idle", &structure.idle.len())
            .field("total", &structure.total)
            .field("shutdown", &structure.shutdown)
            .finish()
    }
}
