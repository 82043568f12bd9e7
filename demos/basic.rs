//! Basic usage example for the admission crate.

use admission::{
    AlarmSink, OverflowPolicy, PoolBuilder, QueueBuilder, QueueConfig, RateLimiterChain,
    Registry, WindowSpec, WorkQueue, WorkResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    println!("=== Basic Admission Example ===\n");

    // Example 1: Multi-window rate limiting
    limiter_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 2: Overflow policies and alarms
    queue_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 3: Queue drained by an elastic pool
    pool_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 4: Registry management surface
    registry_example();
}

/// Prints every alarm it receives.
struct PrintingSink;

impl AlarmSink for PrintingSink {
    fn raise_threshold_exceeded(&self, queue: &str) {
        println!("   🔔 {queue}: threshold exceeded");
    }
    fn raise_max_size_exceeded(&self, queue: &str) {
        println!("   🚨 {queue}: max size exceeded");
    }
    fn raise_queue_ok_again(&self, queue: &str) {
        println!("   ✅ {queue}: room again");
    }
    fn raise_queue_threshold_ok(&self, queue: &str) {
        println!("   ✅ {queue}: back under threshold");
    }
    fn register_queue(&self, queue: &str) {
        println!("   + registered {queue}");
    }
    fn unregister_queue(&self, queue: &str) {
        println!("   - unregistered {queue}");
    }
}

fn limiter_example() {
    println!("1. Rate Limiter Chain:");

    // 3 per second, and no more than 4 per minute.
    let chain = RateLimiterChain::parse("inbound", "1:3, 60:4").expect("valid windows");
    chain.start();
    println!("   Windows: {:?}", chain.windows());

    for i in 1..=5 {
        if chain.check() {
            println!("   Request {} - ✅ Admitted  remaining={:?}", i, chain.remaining());
        } else {
            println!("   Request {} - ❌ Rejected  remaining={:?}", i, chain.remaining());
        }
    }

    println!("   Waiting 1 second for the fast window...");
    thread::sleep(Duration::from_millis(1_050));

    // The fast window refills, but the minute window only has one left.
    for i in 6..=7 {
        let admitted = chain.check();
        println!(
            "   Request {} - {}",
            i,
            if admitted { "✅ Admitted" } else { "❌ Rejected" }
        );
    }

    println!("   {}", chain.stats());
}

fn queue_example() {
    println!("2. Bounded Alarm Queue:");

    let queue = QueueBuilder::new("REQUESTI")
        .capacity(5)
        .policy(OverflowPolicy::DropOldest)
        .threshold_percent(60)
        .hysteresis(0.2)
        .sink(Arc::new(PrintingSink))
        .build()
        .expect("valid queue settings");

    println!(
        "   Threshold at {} items, clears at {}",
        queue.threshold_size(),
        queue.lower_threshold_size()
    );

    for i in 1..=7 {
        queue.push(move || -> WorkResult {
            println!("   processing item {i}");
            Ok(())
        });
        println!("   enqueued {} (size {})", i, queue.size());
    }

    while let Some(item) = queue.try_dequeue() {
        if let Err(err) = item.process() {
            println!("   item failed: {err}");
        }
    }

    println!("   Average size: {:.2}", queue.average_size());
    println!("   {}", queue.stats());
}

fn pool_example() {
    println!("3. Elastic Worker Pool:");

    let pool = Arc::new(
        PoolBuilder::new("io")
            .min_workers(2)
            .reap_interval_ms(200)
            .fast_reap_interval_ms(50)
            .build()
            .expect("valid pool settings"),
    );
    let queue = Arc::new(
        QueueBuilder::new("work")
            .capacity(100)
            .build()
            .expect("valid queue settings"),
    );
    let work = WorkQueue::new(queue, Arc::clone(&pool), 6).expect("max_workers > 0");
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..30 {
        let done = Arc::clone(&done);
        work.push(move || -> WorkResult {
            thread::sleep(Duration::from_millis(20));
            if i % 10 == 9 {
                return Err(format!("item {i} failed").into());
            }
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    thread::sleep(Duration::from_millis(50));
    println!("   Under load: {}", pool.stats());

    while work.active_workers() > 0 || !work.queue().is_empty() {
        thread::sleep(Duration::from_millis(10));
    }
    println!("   Succeeded: {}", done.load(Ordering::SeqCst));

    println!("   Waiting for the reaper...");
    thread::sleep(Duration::from_millis(600));
    println!("   After reaping: {}", pool.stats());
}

fn registry_example() {
    println!("4. Registry:");

    let registry = Registry::new();
    registry.add_alarm_listener(Arc::new(PrintingSink));
    registry
        .add_limiter("OPTIONS", &[WindowSpec::per_second(2)])
        .expect("valid windows");
    registry
        .create_queue(QueueConfig::new("RESPONSEI", 50))
        .expect("valid queue settings");

    registry
        .set_policy("RESPONSEI", OverflowPolicy::Unbounded)
        .expect("queue exists");
    registry
        .set_threshold_percent("RESPONSEI", 90)
        .expect("queue exists");

    println!("   RESPONSEI policy: {:?}", registry.policy("RESPONSEI"));
    println!(
        "   RESPONSEI threshold: {:?}%",
        registry.threshold_percent("RESPONSEI")
    );
    let admitted = (0..4).filter(|_| registry.check("OPTIONS")).count();
    println!("   OPTIONS admitted {admitted} of 4");
    println!("   {}", registry.stats());

    registry.close_all();
}
