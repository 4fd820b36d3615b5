use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use occurrence_rarity::error::RarityError;
use occurrence_rarity::pool::{ConnectionPool, Connector, PoolHealth};
use occurrence_rarity::remote::{CallFailure, ResilientClient, RetryPolicy};
use occurrence_rarity::throttle::{RateBudget, RateLimits};

/// Each connection remembers which build produced it.
#[derive(Default)]
struct CountingConnector {
    builds: AtomicU32,
}

impl Connector for CountingConnector {
    type Connection = u32;

    fn connect(&self) -> Result<u32, RarityError> {
        Ok(self.builds.fetch_add(1, Ordering::SeqCst))
    }
}

fn client(qps: u32, concurrency: usize, max_attempts: u32) -> ResilientClient<CountingConnector> {
    let pool = Arc::new(ConnectionPool::new(CountingConnector::default()).unwrap());
    let budget = Arc::new(RateBudget::new(RateLimits::new(qps, concurrency).unwrap()));
    ResilientClient::new(
        pool,
        budget,
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        },
    )
}

#[test]
fn flaky_call_succeeds_on_last_attempt() {
    let client = client(1000, 4, 3);
    let attempts = AtomicU32::new(0);

    let value = client
        .call("flaky", |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CallFailure::transient("503"))
            } else {
                Ok(42)
            }
        })
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.budget().stats().issued, 3);
    assert_eq!(client.budget().stats().in_flight, 0);
}

#[test]
fn exhausted_call_reports_key_and_attempts() {
    let client = client(1000, 4, 3);
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = client.call("2480242", |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(CallFailure::transient("timed out"))
    });

    assert_matches!(
        result,
        Err(RarityError::RemoteCallExhausted { ref key, attempts: 3, ref last_error })
            if key == "2480242" && last_error == "timed out"
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn permanent_failure_is_not_retried() {
    let client = client(1000, 4, 5);
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = client.call("bad", |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(CallFailure::permanent("GBIF returned status 400"))
    });

    assert_matches!(result, Err(RarityError::RemoteCallExhausted { attempts: 1, .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn reset_rebuilds_pool_before_retrying() {
    let client = client(1000, 4, 3);
    let seen = Mutex::new(Vec::new());

    let value = client
        .call("reset", |conn| {
            seen.lock().unwrap().push(*conn);
            if *conn == 0 {
                Err(CallFailure::reset("connection reset by peer"))
            } else {
                Ok(*conn)
            }
        })
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(client.pool().rebuilds(), 1);
    assert_eq!(client.pool().generation(), 1);
    assert_eq!(client.pool().health(), PoolHealth::Healthy);
}

#[test]
fn concurrent_resets_on_one_generation_rebuild_once() {
    let client = client(1000, 8, 2);
    let barrier = std::sync::Barrier::new(4);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                client
                    .call("burst", |conn| {
                        if *conn == 0 {
                            barrier.wait();
                            Err(CallFailure::reset("broken pipe"))
                        } else {
                            Ok(())
                        }
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(client.pool().rebuilds(), 1);
}

#[test]
fn in_flight_never_exceeds_concurrency() {
    let client = client(1000, 3, 1);
    let current = AtomicUsize::new(0);
    let observed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..12 {
            scope.spawn(|| {
                client
                    .call("slow", |_| {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        observed.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
            });
        }
    });

    assert!(observed.load(Ordering::SeqCst) <= 3);
    let stats = client.budget().stats();
    assert!(stats.peak_in_flight <= 3);
    assert_eq!(stats.issued, 12);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn attempts_respect_the_rolling_window() {
    let client = client(5, 20, 1);
    let issued = Mutex::new(Vec::new());
    let started = Instant::now();

    thread::scope(|scope| {
        for _ in 0..12 {
            scope.spawn(|| {
                client
                    .call("window", |_| {
                        issued.lock().unwrap().push(Instant::now());
                        Ok(())
                    })
                    .unwrap();
            });
        }
    });

    assert!(started.elapsed() >= Duration::from_millis(1950));
    let mut issued = issued.into_inner().unwrap();
    issued.sort();
    for (index, first) in issued.iter().enumerate() {
        let in_window = issued[index..]
            .iter()
            .take_while(|at| at.duration_since(*first) < Duration::from_millis(990))
            .count();
        assert!(in_window <= 5, "{in_window} attempts inside one window");
    }
}

#[test]
fn passed_deadline_cancels_calls() {
    let client = client(1000, 4, 3);
    client.budget().set_deadline(Instant::now());

    let result: Result<(), _> = client.call("late", |_| Ok(()));
    assert_matches!(result, Err(RarityError::Cancelled));
    assert!(client.budget().is_cancelled());
}

#[test]
fn cancel_wakes_waiters_blocked_on_the_window() {
    let client = client(1, 4, 1);
    client.call("first", |_| Ok(())).unwrap();

    let result = thread::scope(|scope| {
        let waiter = scope.spawn(|| client.call("second", |_| Ok(())));
        thread::sleep(Duration::from_millis(50));
        client.budget().cancel();
        waiter.join().unwrap()
    });

    assert_matches!(result, Err(RarityError::Cancelled));
}
