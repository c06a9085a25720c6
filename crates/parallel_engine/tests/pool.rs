use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parallel_engine::{Event, PoolConfig, WorkerPool};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn workers_are_named_from_config() {
    init_logging();
    let config = PoolConfig::new(2).with_thread_name("engine-test");
    let pool = WorkerPool::new(config).unwrap();
    let names = Arc::new(DashMap::new());
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let names = Arc::clone(&names);
            pool.submit(move || {
                let name = thread::current().name().unwrap_or_default().to_owned();
                names.insert(name, ());
            })
        })
        .collect();
    assert!(WorkerPool::await_all(&handles, Some(Duration::from_secs(10))));
    assert!(!names.is_empty());
    assert!(names.iter().all(|entry| entry.key().starts_with("engine-test-")));
    assert_eq!(pool.thread_count(), 2);
}

#[test]
fn panicking_job_does_not_kill_the_pool() {
    init_logging();
    let pool = WorkerPool::with_threads(2).unwrap();
    let failed = pool.submit(|| panic!("job failure"));
    assert!(failed.wait_timeout(Duration::from_secs(10)));

    let ran = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ran = Arc::clone(&ran);
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    assert!(WorkerPool::await_all(&handles, None));
    assert_eq!(ran.load(Ordering::SeqCst), 32);

    // Counters are bumped after a job's handle completes.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().executed < 33 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    let stats = pool.stats();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.executed, 33);
}

#[test]
fn await_any_reports_the_first_finished_job() {
    let pool = WorkerPool::with_threads(2).unwrap();
    let gate = Arc::new(Event::new());
    let blocked = Arc::clone(&gate);
    let slow = pool.submit(move || {
        blocked.wait_timeout(Duration::from_secs(10));
    });
    let fast = pool.submit(|| {});
    let started = Instant::now();
    assert_eq!(WorkerPool::await_any(&[slow.clone(), fast], Some(Duration::from_secs(5))), Some(1));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(WorkerPool::await_any(&[slow.clone()], Some(Duration::from_millis(10))), None);
    gate.set();
    assert!(slow.wait_timeout(Duration::from_secs(10)));
}

#[test]
fn scope_jobs_borrow_and_finish_before_return() {
    let pool = WorkerPool::with_threads(3).unwrap();
    let mut slots = vec![0_u64; 64];
    pool.scope(|scope| {
        for (index, slot) in slots.iter_mut().enumerate() {
            scope.spawn(move || *slot = index as u64 * 2);
        }
    });
    assert!(slots.iter().enumerate().all(|(index, value)| *value == index as u64 * 2));
}

#[test]
fn limited_scheduler_never_exceeds_its_limit() {
    init_logging();
    let pool = Arc::new(WorkerPool::with_threads(6).unwrap());
    let limited = pool.limited(NonZeroUsize::new(3).unwrap());
    assert_eq!(limited.limit(), 3);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..40)
        .map(|_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            limited.submit(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    assert!(WorkerPool::await_all(&handles, Some(Duration::from_secs(30))));
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    // Permits are returned just after each handle completes.
    let deadline = Instant::now() + Duration::from_secs(5);
    while limited.active() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(limited.active(), 0);
    assert_eq!(limited.queued(), 0);
}

#[test]
fn dropping_a_pool_joins_its_workers() {
    let finished = Arc::new(AtomicUsize::new(0));
    {
        let pool = WorkerPool::with_threads(2).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let finished = Arc::clone(&finished);
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert!(WorkerPool::await_all(&handles, None));
    }
    assert_eq!(finished.load(Ordering::SeqCst), 4);
}
