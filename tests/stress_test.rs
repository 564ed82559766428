//! Stress tests for the executors

use loopexec::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn loop_executor(name: &str) -> Arc<LoopExecutor> {
    let factory = ThreadFactory::new(name, Priority::Normal, 0, false);
    Arc::new(LoopExecutor::new(Looper::spawn(&factory).unwrap()))
}

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_many_producers_one_loop() {
    let executor = loop_executor("stress-loop");
    let counter = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let executor = executor.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let counter = counter.clone();
                    executor
                        .spawn(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    // everything posted before shutdown is already due, so it all runs
    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(30)));
    assert_eq!(counter.load(Ordering::Relaxed), 80_000);
}

#[test]
#[ignore]
fn stress_test_per_producer_order_is_kept() {
    let executor = loop_executor("stress-order");
    let seen = Arc::new(Mutex::new(vec![Vec::new(); 4]));

    let producers: Vec<_> = (0..4)
        .map(|id| {
            let executor = executor.clone();
            let seen = seen.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    let seen = seen.clone();
                    executor.spawn(move || seen.lock()[id].push(i)).unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(30)));

    for per_producer in seen.lock().iter() {
        assert_eq!(*per_producer, (0..5_000).collect::<Vec<_>>());
    }
}

#[test]
#[ignore]
fn stress_test_cancel_races_dispatch() {
    let executor = loop_executor("stress-cancel");
    let ran = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..5_000u64 {
        let ran = ran.clone();
        handles.push(
            executor
                .schedule(
                    move || {
                        ran.fetch_add(1, Ordering::Relaxed);
                    },
                    Duration::from_micros(i % 500),
                )
                .unwrap(),
        );
    }

    let cancelled = handles.iter().filter(|h| h.cancel(false)).count();
    for handle in &handles {
        let _ = handle.wait();
        assert!(handle.is_done());
    }

    // a cancel can land while the body runs, so the two may overlap
    let ran = ran.load(Ordering::Relaxed);
    let completed = handles.iter().filter(|h| h.state() == TaskState::Completed).count();
    assert_eq!(completed + cancelled, 5_000);
    assert!(ran >= completed);

    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(10)));
}

#[test]
#[ignore]
fn stress_test_immediate_from_many_threads() {
    let executor = Arc::new(ImmediateExecutor::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let executor = executor.clone();
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let counter = counter.clone();
                    if executor
                        .spawn(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(5));
    executor.shutdown();
    assert!(executor.await_termination(Duration::from_secs(10)));
    assert_eq!(executor.running_count(), 0);

    for caller in callers {
        caller.join().unwrap();
    }
}

#[test]
#[ignore]
fn stress_test_elastic_burst() {
    let executors = Executors::with_spawned_main(Config::default()).unwrap();
    let pool = executors.elastic().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..200 {
        let counter = counter.clone();
        handles.push(
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap(),
        );
    }
    for handle in handles {
        handle.get().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 200);
    assert!(pool.largest_pool_size() <= executors.config().pool_max_threads);

    executors.shutdown();
    assert!(executors.await_termination(Duration::from_secs(10)));
}
