//! # Admission Registry
//!
//! An explicit, owned lookup of named limiter chains and queues, handed to
//! whichever collaborators need it instead of living in process-wide state.
//! Operational tooling reaches queues by name through the management methods
//! here.
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!     check("inbound") │ limiters: DashMap            │
//!     ────────────────►│   "inbound" → RateLimiterChain│──► ThrottleListener
//!                      │ queues:   DashMap            │
//!     set_max_size(..) │   "REQUESTI" → WorkQueue     │
//!     ────────────────►│   "EVENTS"   → queue         │──► AlarmFanout ──► listeners
//!                      └──────────────────────────────┘
//! ```
//!
//! Every queue created here reports to the registry's [`AlarmFanout`], so
//! listeners added at any time see alarms from all of them.

use super::{
    alarm::{AlarmFanout, AlarmSink, ThrottleListener},
    config::{validate_windows, OverflowPolicy, QueueConfig, WindowSpec},
    dispatch::WorkQueue,
    error::ConfigError,
    limiter::RateLimiterChain,
    metrics::RegistryStats,
    pool::WorkerPool,
    queue::BoundedAlarmQueue,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

type NameMap<V> = DashMap<String, V, ahash::RandomState>;

#[derive(Clone)]
enum QueueEntry {
    Plain(Arc<BoundedAlarmQueue>),
    Dispatched(WorkQueue),
}

impl QueueEntry {
    fn queue(&self) -> &Arc<BoundedAlarmQueue> {
        match self {
            QueueEntry::Plain(queue) => queue,
            QueueEntry::Dispatched(work) => work.queue(),
        }
    }
}

/// Named limiter chains and queues with a shared alarm fan-out.
///
/// # Example
///
/// ```rust
/// use admission::{LoggingAlarmSink, QueueConfig, Registry, WindowSpec};
/// use std::sync::Arc;
///
/// let registry = Registry::new();
/// registry.add_alarm_listener(Arc::new(LoggingAlarmSink));
///
/// registry.add_limiter("inbound", &[WindowSpec::per_second(100)]).unwrap();
/// assert!(registry.check("inbound"));
///
/// registry.create_queue(QueueConfig::new("EVENTS", 500)).unwrap();
/// registry.set_threshold_percent("EVENTS", 90).unwrap();
/// assert_eq!(registry.threshold_percent("EVENTS"), Some(90));
/// assert_eq!(registry.queue_size("missing"), None);
/// ```
pub struct Registry {
    limiters: NameMap<Arc<RateLimiterChain>>,
    queues: NameMap<QueueEntry>,
    alarms: Arc<AlarmFanout>,
    throttle_listener: RwLock<Option<Arc<dyn ThrottleListener>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        // Shard count scales with cores, capped to keep the maps small.
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .next_power_of_two()
            .clamp(4, 32);

        Self {
            limiters: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                ahash::RandomState::new(),
                shards,
            ),
            queues: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                ahash::RandomState::new(),
                shards,
            ),
            alarms: Arc::new(AlarmFanout::new()),
            throttle_listener: RwLock::new(None),
        }
    }

    // ----- alarm and throttle listeners -----

    /// The sink every registry-created queue reports to.
    pub fn alarm_sink(&self) -> Arc<dyn AlarmSink> {
        self.alarms.clone()
    }

    /// Adds a listener for alarms from all registry queues.
    pub fn add_alarm_listener(&self, listener: Arc<dyn AlarmSink>) {
        self.alarms.add_listener(listener);
    }

    /// Removes an alarm listener; `true` if it was registered.
    pub fn remove_alarm_listener(&self, listener: &Arc<dyn AlarmSink>) -> bool {
        self.alarms.remove_listener(listener)
    }

    /// Sets the throttle listener on every current and future limiter.
    pub fn set_throttle_listener(&self, listener: Arc<dyn ThrottleListener>) {
        *self.throttle_listener.write() = Some(Arc::clone(&listener));
        for entry in self.limiters.iter() {
            entry.value().set_listener(Arc::clone(&listener));
        }
    }

    // ----- rate limiters -----

    /// Builds, starts and registers a limiter chain.
    ///
    /// A chain already registered under `name` is stopped and replaced.
    ///
    /// # Errors
    ///
    /// Window validation errors from [`RateLimiterChain::new`].
    pub fn add_limiter(
        &self,
        name: &str,
        windows: &[WindowSpec],
    ) -> Result<Arc<RateLimiterChain>, ConfigError> {
        let chain = Arc::new(RateLimiterChain::new(name, windows)?);
        chain.start();
        self.register_limiter(Arc::clone(&chain));
        Ok(chain)
    }

    /// Registers an existing chain under its own name, returning the chain it
    /// replaced (stopped).
    pub fn register_limiter(&self, chain: Arc<RateLimiterChain>) -> Option<Arc<RateLimiterChain>> {
        if let Some(listener) = self.throttle_listener.read().clone() {
            chain.set_listener(listener);
        }
        let previous = self.limiters.insert(chain.name().to_string(), chain);
        if let Some(previous) = &previous {
            previous.stop();
            debug!(limiter = previous.name(), "replaced rate limiter");
        }
        previous
    }

    /// Looks up a chain.
    pub fn limiter(&self, name: &str) -> Option<Arc<RateLimiterChain>> {
        self.limiters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Stops and removes a chain.
    pub fn remove_limiter(&self, name: &str) -> Option<Arc<RateLimiterChain>> {
        let (_, chain) = self.limiters.remove(name)?;
        chain.stop();
        Some(chain)
    }

    /// Runs one event through the named chain. A name with no chain is not
    /// throttled and always admits.
    pub fn check(&self, name: &str) -> bool {
        match self.limiter(name) {
            Some(chain) => chain.check(),
            None => true,
        }
    }

    /// Replaces a running chain's windows: stop, reconfigure, restart.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownLimiter`], or a window validation error; the
    /// chain is left untouched, budget included, in that case.
    pub fn reconfigure_limiter(&self, name: &str, windows: &[WindowSpec]) -> Result<(), ConfigError> {
        let chain = self
            .limiter(name)
            .ok_or_else(|| ConfigError::UnknownLimiter(name.to_string()))?;

        if let Err(err) = validate_windows(windows) {
            warn!(limiter = name, error = %err, "rejected limiter reconfiguration");
            return Err(err);
        }

        let was_running = chain.is_running();
        chain.stop();
        let result = chain.reconfigure(windows);
        if was_running {
            chain.start();
        }
        result
    }

    /// Registered chain names.
    pub fn limiter_names(&self) -> Vec<String> {
        self.limiters.iter().map(|entry| entry.key().clone()).collect()
    }

    // ----- queues -----

    /// Creates a queue reporting to the registry's alarm fan-out.
    ///
    /// A queue already registered under the same name is closed first.
    ///
    /// # Errors
    ///
    /// Validation errors from [`QueueConfig::validate`].
    pub fn create_queue(&self, config: QueueConfig) -> Result<Arc<BoundedAlarmQueue>, ConfigError> {
        config.validate()?;
        self.remove_queue(&config.name);

        let queue = Arc::new(BoundedAlarmQueue::with_sink(config, self.alarm_sink())?);
        self.queues
            .insert(queue.name().to_string(), QueueEntry::Plain(Arc::clone(&queue)));
        Ok(queue)
    }

    /// Creates a queue drained by at most `max_workers` workers of `pool`.
    ///
    /// # Errors
    ///
    /// Validation errors from [`QueueConfig::validate`], or
    /// [`ConfigError::InvalidPool`] if `max_workers` is 0.
    pub fn create_work_queue(
        &self,
        config: QueueConfig,
        pool: Arc<WorkerPool>,
        max_workers: usize,
    ) -> Result<WorkQueue, ConfigError> {
        config.validate()?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidPool("max_workers must be at least 1"));
        }
        self.remove_queue(&config.name);

        let queue = Arc::new(BoundedAlarmQueue::with_sink(config, self.alarm_sink())?);
        let work = WorkQueue::new(queue, pool, max_workers)?;
        self.queues
            .insert(work.name().to_string(), QueueEntry::Dispatched(work.clone()));
        Ok(work)
    }

    /// Looks up a queue.
    pub fn queue(&self, name: &str) -> Option<Arc<BoundedAlarmQueue>> {
        self.entry(name).map(|entry| Arc::clone(entry.queue()))
    }

    /// Looks up a queue created with a dispatcher.
    pub fn work_queue(&self, name: &str) -> Option<WorkQueue> {
        match self.entry(name)? {
            QueueEntry::Dispatched(work) => Some(work),
            QueueEntry::Plain(_) => None,
        }
    }

    /// Closes and removes a queue; `true` if it existed.
    pub fn remove_queue(&self, name: &str) -> bool {
        match self.queues.remove(name) {
            Some((_, entry)) => {
                entry.queue().close();
                true
            }
            None => false,
        }
    }

    /// Registered queue names.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    // ----- queue management surface -----

    /// Current size of the named queue.
    pub fn queue_size(&self, name: &str) -> Option<usize> {
        self.queue(name).map(|queue| queue.size())
    }

    /// Overflow policy of the named queue.
    pub fn policy(&self, name: &str) -> Option<OverflowPolicy> {
        self.queue(name).map(|queue| queue.policy())
    }

    /// Sets the overflow policy of the named queue.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownQueue`].
    pub fn set_policy(&self, name: &str, policy: OverflowPolicy) -> Result<(), ConfigError> {
        self.require_queue(name)?.set_policy(policy);
        Ok(())
    }

    /// Capacity of the named queue.
    pub fn max_size(&self, name: &str) -> Option<usize> {
        self.queue(name).map(|queue| queue.max_size())
    }

    /// Sets the capacity of the named queue.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownQueue`] or [`ConfigError::InvalidCapacity`].
    pub fn set_max_size(&self, name: &str, capacity: usize) -> Result<(), ConfigError> {
        self.require_queue(name)?.set_max_size(capacity)
    }

    /// Threshold of the named queue, as a percentage of its capacity.
    pub fn threshold_percent(&self, name: &str) -> Option<u32> {
        self.queue(name).map(|queue| queue.threshold_percent())
    }

    /// Sets the threshold of the named queue as a percentage of capacity.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownQueue`], or the queue's own validation error.
    pub fn set_threshold_percent(&self, name: &str, percent: u32) -> Result<(), ConfigError> {
        self.require_queue(name)?.set_threshold_percent(percent)
    }

    /// Worker cap of the named queue, if it has a dispatcher.
    pub fn max_workers(&self, name: &str) -> Option<usize> {
        self.work_queue(name).map(|work| work.max_workers())
    }

    /// Sets the worker cap of the named queue.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownQueue`] if there is no queue with a dispatcher
    /// under `name`, or [`ConfigError::InvalidPool`] for 0.
    pub fn set_max_workers(&self, name: &str, max_workers: usize) -> Result<(), ConfigError> {
        self.work_queue(name)
            .ok_or_else(|| ConfigError::UnknownQueue(name.to_string()))?
            .set_max_workers(max_workers)
    }

    /// Workers currently draining the named queue.
    pub fn active_workers(&self, name: &str) -> Option<usize> {
        self.work_queue(name).map(|work| work.active_workers())
    }

    /// Averaging window of the named queue in seconds.
    pub fn average_window_secs(&self, name: &str) -> Option<u64> {
        self.queue(name).map(|queue| queue.average_window_secs())
    }

    /// Sets the averaging window of the named queue.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownQueue`] or [`ConfigError::InvalidAverageWindow`].
    pub fn set_average_window_secs(&self, name: &str, secs: u64) -> Result<(), ConfigError> {
        self.require_queue(name)?.set_average_window_secs(secs)
    }

    /// Average size of the named queue over its window.
    pub fn average_size(&self, name: &str) -> Option<f64> {
        self.queue(name).map(|queue| queue.average_size())
    }

    // ----- lifecycle -----

    /// Closes every queue, stops every limiter and empties the registry.
    pub fn close_all(&self) {
        let queues: Vec<QueueEntry> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.queues.clear();
        for entry in &queues {
            entry.queue().close();
        }

        let limiters = self.limiters.len();
        for entry in self.limiters.iter() {
            entry.value().stop();
        }
        self.limiters.clear();

        info!(
            "Closed admission registry ({} queues, {} limiters)",
            queues.len(),
            limiters
        );
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RegistryStats {
        let mut work_queues = 0;
        for entry in self.queues.iter() {
            if matches!(entry.value(), QueueEntry::Dispatched(_)) {
                work_queues += 1;
            }
        }
        RegistryStats {
            limiters: self.limiters.len(),
            running_limiters: self
                .limiters
                .iter()
                .filter(|entry| entry.value().is_running())
                .count(),
            queues: self.queues.len(),
            work_queues,
            alarm_listeners: self.alarms.listener_count(),
        }
    }

    // Clones the entry out so no map guard is held while the caller runs
    // queue code that may call back into the registry through a sink.
    fn entry(&self, name: &str) -> Option<QueueEntry> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    fn require_queue(&self, name: &str) -> Result<Arc<BoundedAlarmQueue>, ConfigError> {
        self.queue(name)
            .ok_or_else(|| ConfigError::UnknownQueue(name.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("limiters", &self.limiters.len())
            .field("queues", &self.queues.len())
            .field("alarms", &self.alarms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::alarm::testing::{Alarm, RecordingSink};
    use super::*;
    use crate::admission::config::PoolConfig;
    use crate::admission::error::WorkResult;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_limiter_lifecycle() {
        let registry = Registry::new();
        let chain = registry
            .add_limiter("inbound", &[WindowSpec::new(60, 2)])
            .unwrap();
        assert!(chain.is_running());

        assert!(registry.check("inbound"));
        assert!(registry.check("inbound"));
        assert!(!registry.check("inbound"));
        assert!(registry.check("unknown"));

        let removed = registry.remove_limiter("inbound").unwrap();
        assert!(!removed.is_running());
        assert!(registry.limiter("inbound").is_none());
    }

    #[test]
    fn test_replacing_limiter_stops_previous() {
        let registry = Registry::new();
        let first = registry.add_limiter("l", &[WindowSpec::new(1, 1)]).unwrap();
        let second = registry.add_limiter("l", &[WindowSpec::new(1, 5)]).unwrap();

        assert!(!first.is_running());
        assert!(second.is_running());
        assert_eq!(registry.limiter_names(), vec!["l".to_string()]);
    }

    #[test]
    fn test_reconfigure_limiter_keeps_it_running() {
        let registry = Registry::new();
        registry.add_limiter("l", &[WindowSpec::new(60, 1)]).unwrap();
        assert!(registry.check("l"));
        assert!(!registry.check("l"));

        registry
            .reconfigure_limiter("l", &[WindowSpec::new(60, 3)])
            .unwrap();
        let chain = registry.limiter("l").unwrap();
        assert!(chain.is_running());
        assert_eq!(chain.windows(), vec![WindowSpec::new(60, 3)]);
        assert!(registry.check("l"));

        assert!(registry.check("l"));
        assert!(registry.check("l"));
        assert!(!registry.check("l"));

        // A rejected change must not hand out a fresh burst.
        assert!(matches!(
            registry.reconfigure_limiter("l", &[WindowSpec::new(0, 3)]),
            Err(ConfigError::NonPositiveWindow { .. })
        ));
        assert!(matches!(
            registry.reconfigure_limiter("l", &[]),
            Err(ConfigError::EmptyWindows)
        ));
        assert!(chain.is_running());
        assert_eq!(chain.windows(), vec![WindowSpec::new(60, 3)]);
        assert_eq!(chain.remaining(), vec![0]);
        assert!(!registry.check("l"));

        assert!(matches!(
            registry.reconfigure_limiter("nope", &[WindowSpec::new(1, 1)]),
            Err(ConfigError::UnknownLimiter(_))
        ));
    }

    #[test]
    fn test_throttle_listener_applies_to_all_limiters() {
        let registry = Registry::new();
        registry.add_limiter("early", &[WindowSpec::new(60, 1)]).unwrap();

        let listener = Arc::new(RecordingSink::default());
        registry.set_throttle_listener(listener.clone());
        registry.add_limiter("late", &[WindowSpec::new(60, 1)]).unwrap();

        for name in ["early", "late"] {
            assert!(registry.check(name));
            assert!(!registry.check(name));
        }
        assert_eq!(listener.count(&Alarm::Throttled("early".into())), 1);
        assert_eq!(listener.count(&Alarm::Throttled("late".into())), 1);
    }

    #[test]
    fn test_queue_alarms_fan_out_to_listeners() {
        let registry = Registry::new();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        registry.add_alarm_listener(a.clone());
        registry.add_alarm_listener(b.clone());

        let queue = registry.create_queue(QueueConfig::new("EVENTS", 2)).unwrap();
        queue.push(|| -> WorkResult { Ok(()) });
        queue.push(|| -> WorkResult { Ok(()) });
        assert!(registry.remove_queue("EVENTS"));
        assert!(!registry.remove_queue("EVENTS"));

        for sink in [&a, &b] {
            assert_eq!(sink.count(&Alarm::Registered("EVENTS".into())), 1);
            assert_eq!(sink.count(&Alarm::MaxSizeExceeded("EVENTS".into())), 1);
            assert_eq!(sink.count(&Alarm::Unregistered("EVENTS".into())), 1);
        }

        let a: Arc<dyn AlarmSink> = a;
        assert!(registry.remove_alarm_listener(&a));
    }

    #[test]
    fn test_management_surface() {
        let registry = Registry::new();
        registry.create_queue(QueueConfig::new("q", 100)).unwrap();

        assert_eq!(registry.queue_size("q"), Some(0));
        assert_eq!(registry.max_size("q"), Some(100));
        assert_eq!(registry.policy("q"), Some(OverflowPolicy::DropNewest));
        assert_eq!(registry.threshold_percent("q"), Some(80));
        assert_eq!(registry.average_window_secs("q"), Some(5));
        assert_eq!(registry.average_size("q"), Some(0.0));

        registry.set_max_size("q", 50).unwrap();
        registry.set_policy("q", OverflowPolicy::DropOldest).unwrap();
        registry.set_threshold_percent("q", 60).unwrap();
        registry.set_average_window_secs("q", 10).unwrap();

        assert_eq!(registry.max_size("q"), Some(50));
        assert_eq!(registry.policy("q"), Some(OverflowPolicy::DropOldest));
        assert_eq!(registry.threshold_percent("q"), Some(60));
        assert_eq!(registry.average_window_secs("q"), Some(10));

        // Plain queues have no worker settings.
        assert_eq!(registry.max_workers("q"), None);
        assert!(matches!(
            registry.set_max_workers("q", 2),
            Err(ConfigError::UnknownQueue(_))
        ));

        assert_eq!(registry.queue_size("missing"), None);
        assert!(matches!(
            registry.set_max_size("missing", 10),
            Err(ConfigError::UnknownQueue(_))
        ));
    }

    #[test]
    fn test_work_queue_registration() {
        let registry = Registry::new();
        let pool = Arc::new(WorkerPool::new(PoolConfig::new("reg", 1)).unwrap());
        let work = registry
            .create_work_queue(QueueConfig::new("REQUESTI", 10), pool, 2)
            .unwrap();

        assert_eq!(registry.max_workers("REQUESTI"), Some(2));
        registry.set_max_workers("REQUESTI", 4).unwrap();
        assert_eq!(work.max_workers(), 4);

        let (tx, rx) = mpsc::channel();
        registry
            .work_queue("REQUESTI")
            .unwrap()
            .push(move || -> WorkResult {
                tx.send(())?;
                Ok(())
            });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.queues, 1);
        assert_eq!(stats.work_queues, 1);
    }

    #[test]
    fn test_close_all() {
        let registry = Registry::new();
        registry.add_limiter("l", &[WindowSpec::new(1, 1)]).unwrap();
        let queue = registry.create_queue(QueueConfig::new("q", 10)).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.limiters, 1);
        assert_eq!(stats.running_limiters, 1);
        assert!(stats.summary().contains("Queues: 1 (0 dispatched)"));

        registry.close_all();
        assert!(queue.is_closed());
        assert!(registry.queue_names().is_empty());
        assert!(registry.limiter_names().is_empty());
    }
}
