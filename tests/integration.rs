use admission::{
    AlarmSink, BatchSource, BoundedAlarmQueue, OverflowPolicy, PoolBuilder, PoolConfig,
    QueueBuilder, QueueConfig, RateLimiterChain, Registry, ThrottleListener, WindowSpec, WorkItem,
    WorkQueue, WorkResult, WorkSource, WorkerPool,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn record(&self, kind: &str, name: &str) {
        self.events.lock().push(format!("{kind}:{name}"));
    }

    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl AlarmSink for Recorder {
    fn raise_threshold_exceeded(&self, queue: &str) {
        self.record("threshold", queue);
    }
    fn raise_max_size_exceeded(&self, queue: &str) {
        self.record("max", queue);
    }
    fn raise_queue_ok_again(&self, queue: &str) {
        self.record("ok", queue);
    }
    fn raise_queue_threshold_ok(&self, queue: &str) {
        self.record("threshold_ok", queue);
    }
    fn register_queue(&self, queue: &str) {
        self.record("register", queue);
    }
    fn unregister_queue(&self, queue: &str) {
        self.record("unregister", queue);
    }
}

impl ThrottleListener for Recorder {
    fn flow_exceeds_threshold(&self, limiter: &str) {
        self.record("throttled", limiter);
    }
    fn flow_ok_again(&self, limiter: &str) {
        self.record("unthrottled", limiter);
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Work item that appends its label to a shared log when processed.
fn labelled(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Box<dyn WorkItem> {
    let log = Arc::clone(log);
    Box::new(move || -> WorkResult {
        log.lock().push(label);
        Ok(())
    })
}

/// Dequeues and runs everything in `queue`, returning the labels in order.
fn drain_labels(
    queue: &BoundedAlarmQueue,
    log: &Arc<Mutex<Vec<&'static str>>>,
) -> Vec<&'static str> {
    while let Some(item) = queue.try_dequeue() {
        item.process().unwrap();
    }
    log.lock().clone()
}

fn gated_source(gate: &Arc<Barrier>) -> Arc<dyn WorkSource> {
    let gate = Arc::clone(gate);
    Arc::new(BatchSource::single(Box::new(move || -> WorkResult {
        gate.wait();
        Ok(())
    })))
}

// ----- rate limiter chain -----

#[test]
fn test_single_window_refills_after_interval() {
    let chain = RateLimiterChain::new("single", &[WindowSpec::new(1, 3)]).unwrap();
    chain.start();

    let results: Vec<bool> = (0..4).map(|_| chain.check()).collect();
    assert_eq!(results, vec![true, true, true, false]);

    thread::sleep(Duration::from_millis(1_100));
    assert!(chain.check());
}

#[test]
fn test_rejection_rolls_back_faster_windows() {
    let chain =
        RateLimiterChain::new("chain", &[WindowSpec::new(60, 1), WindowSpec::new(1, 5)]).unwrap();
    chain.start();

    assert!(chain.check());
    let before = chain.remaining();
    assert_eq!(before, vec![4, 0]);

    assert!(!chain.check());
    assert_eq!(chain.remaining(), before);

    let stats = chain.stats();
    assert_eq!(stats.total_admitted, 1);
    assert_eq!(stats.total_rejected, 1);
}

#[test]
fn test_concurrent_checks_never_overspend() {
    let chain = Arc::new(
        RateLimiterChain::parse("burst", "1:1000, 60:50").unwrap(),
    );
    chain.start();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let chain = Arc::clone(&chain);
            thread::spawn(move || (0..100).filter(|_| chain.check()).count())
        })
        .collect();
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(admitted, 50);
    // Every rejection was rolled back in the fast window.
    assert_eq!(chain.remaining(), vec![950, 0]);
}

#[test]
fn test_throttle_listener_edges() {
    let recorder = Arc::new(Recorder::default());
    let chain = RateLimiterChain::new("edges", &[WindowSpec::new(1, 1)]).unwrap();
    chain.set_listener(recorder.clone());
    chain.start();

    assert!(chain.check());
    assert!(!chain.check());
    assert!(!chain.check());
    assert_eq!(recorder.count("throttled:edges"), 1);

    thread::sleep(Duration::from_millis(1_100));
    assert!(chain.check());
    assert_eq!(recorder.count("unthrottled:edges"), 1);
}

// ----- bounded alarm queue -----

#[test]
fn test_drop_oldest_keeps_newest() {
    let queue = QueueBuilder::new("oldest")
        .capacity(3)
        .policy(OverflowPolicy::DropOldest)
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for label in ["A", "B", "C", "D"] {
        assert!(queue.enqueue(labelled(&log, label)));
        assert!(queue.size() <= 3);
    }
    assert_eq!(queue.size(), 3);
    assert_eq!(drain_labels(&queue, &log), vec!["B", "C", "D"]);
    assert_eq!(queue.stats().total_dropped, 1);
}

#[test]
fn test_drop_newest_rejects_arrival() {
    let queue = QueueBuilder::new("newest")
        .capacity(3)
        .policy(OverflowPolicy::DropNewest)
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let accepted: Vec<bool> = ["A", "B", "C", "D"]
        .into_iter()
        .map(|label| queue.enqueue(labelled(&log, label)))
        .collect();

    assert_eq!(accepted, vec![true, true, true, false]);
    assert_eq!(drain_labels(&queue, &log), vec!["A", "B", "C"]);
}

#[test]
fn test_threshold_alarm_with_hysteresis() {
    let recorder = Arc::new(Recorder::default());
    let queue = QueueBuilder::new("alarms")
        .capacity(10)
        .threshold_percent(80)
        .hysteresis(0.1)
        .sink(recorder.clone())
        .build()
        .unwrap();
    assert_eq!(recorder.count("register:alarms"), 1);

    for _ in 0..7 {
        queue.push(|| -> WorkResult { Ok(()) });
    }
    assert_eq!(recorder.count("threshold:alarms"), 0);

    queue.push(|| -> WorkResult { Ok(()) });
    assert_eq!(recorder.count("threshold:alarms"), 1);

    queue.push(|| -> WorkResult { Ok(()) });
    queue.push(|| -> WorkResult { Ok(()) });
    assert_eq!(recorder.count("threshold:alarms"), 1);
    assert_eq!(recorder.count("max:alarms"), 1);

    // 10 -> 9 leaves capacity, 9 -> 8 stays above the lower bound of 7.
    assert!(queue.try_dequeue().is_some());
    assert_eq!(recorder.count("ok:alarms"), 1);
    assert!(queue.try_dequeue().is_some());
    assert_eq!(recorder.count("threshold_ok:alarms"), 0);

    assert!(queue.try_dequeue().is_some());
    assert_eq!(recorder.count("threshold_ok:alarms"), 1);

    while queue.try_dequeue().is_some() {}
    assert_eq!(recorder.count("threshold_ok:alarms"), 1);
    assert_eq!(recorder.count("threshold:alarms"), 1);

    queue.close();
    assert_eq!(recorder.count("unregister:alarms"), 1);
}

#[test]
fn test_blocking_consumer_sees_fifo_order() {
    let queue = Arc::new(
        BoundedAlarmQueue::new(QueueConfig::new("fifo", 1_000)).unwrap(),
    );
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut seen = 0;
            while let Some(item) = queue.dequeue() {
                item.process().unwrap();
                seen += 1;
            }
            seen
        })
    };

    let next = Arc::new(AtomicUsize::new(0));
    for i in 0..200 {
        let next = Arc::clone(&next);
        queue.push(move || -> WorkResult {
            assert_eq!(next.fetch_add(1, Ordering::SeqCst), i);
            Ok(())
        });
    }

    wait_for("consumer to drain", || queue.is_empty());
    wait_for("last item", || next.load(Ordering::SeqCst) == 200);
    queue.close();
    assert_eq!(consumer.join().unwrap(), 200);
}

// ----- elastic worker pool -----

#[test]
fn test_pool_grows_then_idles() {
    let pool = WorkerPool::new(PoolConfig::new("grow", 2).with_reap_intervals(600_000, 600_000))
        .unwrap();
    let gate = Arc::new(Barrier::new(6));

    for _ in 0..5 {
        pool.assign(gated_source(&gate)).unwrap();
    }
    wait_for("five workers busy", || pool.active_count() == 5);
    assert_eq!(pool.total_count(), 5);

    gate.wait();
    wait_for("workers to idle", || pool.idle_count() == 5);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.total_count(), 5);
}

#[test]
fn test_reaper_settles_at_minimum() {
    let pool = PoolBuilder::new("settle")
        .min_workers(2)
        .reap_interval_ms(40)
        .fast_reap_interval_ms(10)
        .build()
        .unwrap();
    let gate = Arc::new(Barrier::new(6));

    for _ in 0..5 {
        pool.assign(gated_source(&gate)).unwrap();
    }
    wait_for("five workers busy", || pool.active_count() == 5);
    assert_eq!(pool.total_count(), 5);

    gate.wait();
    wait_for("reaper to trim", || pool.total_count() == 2);

    // Several more reaper cycles never go below the floor.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(pool.total_count(), 2);
    assert_eq!(pool.idle_count(), 2);
    assert_eq!(pool.stats().total_reaped, 3);
}

#[test]
fn test_failing_items_are_isolated() {
    let pool = WorkerPool::new(PoolConfig::new("isolated", 1).with_reap_intervals(600_000, 600_000))
        .unwrap();
    let total = pool.total_count();

    pool.execute(Box::new(|| -> WorkResult { Err("bad request".into()) }))
        .unwrap();
    wait_for("failure to be recorded", || pool.stats().total_failed == 1);
    wait_for("worker to idle", || pool.active_count() == 0);

    pool.execute(Box::new(|| -> WorkResult { panic!("handler bug") }))
        .unwrap();
    wait_for("panic to be recorded", || pool.stats().total_failed == 2);
    wait_for("worker to idle", || pool.active_count() == 0);
    assert_eq!(pool.total_count(), total);

    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = Arc::clone(&ran);
        pool.execute(Box::new(move || -> WorkResult {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    }
    wait_for("next item", || ran.load(Ordering::SeqCst) == 1);
    assert_eq!(pool.total_count(), total);
}

#[test]
fn test_shutdown_rejects_new_work() {
    let pool = WorkerPool::new(PoolConfig::new("closing", 2)).unwrap();
    pool.shutdown();
    pool.shutdown();
    assert!(pool.is_shut_down());
    assert!(pool.execute(Box::new(|| -> WorkResult { Ok(()) })).is_err());
}

// ----- dispatch and registry -----

#[test]
fn test_work_queue_end_to_end() {
    let pool = Arc::new(
        PoolBuilder::new("e2e")
            .min_workers(2)
            .reap_interval_ms(600_000)
            .fast_reap_interval_ms(600_000)
            .build()
            .unwrap(),
    );
    let queue = Arc::new(
        QueueBuilder::new("REQUESTI")
            .capacity(10_000)
            .policy(OverflowPolicy::Unbounded)
            .build()
            .unwrap(),
    );
    let work = WorkQueue::new(queue, Arc::clone(&pool), 3).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..1_000 {
        let done = Arc::clone(&done);
        work.push(move || -> WorkResult {
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    wait_for("every item", || done.load(Ordering::SeqCst) == 1_000);
    wait_for("workers to release", || work.active_workers() == 0);
    assert!(pool.total_count() >= 2);
    assert_eq!(work.stats().total_dequeued, 1_000);
}

#[test]
fn test_registry_management_surface() {
    let registry = Registry::new();
    let recorder = Arc::new(Recorder::default());
    registry.add_alarm_listener(recorder.clone());
    registry.set_throttle_listener(recorder.clone());

    registry
        .add_limiter("inbound", &[WindowSpec::new(60, 2)])
        .unwrap();
    assert!(registry.check("inbound"));
    assert!(registry.check("inbound"));
    assert!(!registry.check("inbound"));
    assert!(registry.check("unknown"));
    assert_eq!(recorder.count("throttled:inbound"), 1);

    let pool = Arc::new(PoolBuilder::new("ops").min_workers(1).build().unwrap());
    registry
        .create_work_queue(QueueConfig::new("REQUESTI", 100), pool, 2)
        .unwrap();
    assert_eq!(recorder.count("register:REQUESTI"), 1);

    registry
        .set_policy("REQUESTI", OverflowPolicy::DropOldest)
        .unwrap();
    registry.set_max_size("REQUESTI", 50).unwrap();
    registry.set_threshold_percent("REQUESTI", 60).unwrap();
    registry.set_max_workers("REQUESTI", 4).unwrap();
    registry.set_average_window_secs("REQUESTI", 10).unwrap();

    assert_eq!(registry.policy("REQUESTI"), Some(OverflowPolicy::DropOldest));
    assert_eq!(registry.max_size("REQUESTI"), Some(50));
    assert_eq!(registry.threshold_percent("REQUESTI"), Some(60));
    assert_eq!(registry.max_workers("REQUESTI"), Some(4));
    assert_eq!(registry.average_window_secs("REQUESTI"), Some(10));
    assert_eq!(registry.queue_size("REQUESTI"), Some(0));
    assert!(registry.average_size("REQUESTI").is_some());

    assert_eq!(registry.max_size("missing"), None);
    assert!(registry.set_max_size("missing", 5).is_err());

    let stats = registry.stats();
    assert_eq!(stats.limiters, 1);
    assert_eq!(stats.queues, 1);
    assert_eq!(stats.work_queues, 1);

    registry.close_all();
    assert_eq!(recorder.count("unregister:REQUESTI"), 1);
    assert!(registry.queue_names().is_empty());
    assert!(registry.limiter_names().is_empty());
}
