//! Tests for single-flight coordination

use super::SingleFlight;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn test_concurrent_duplicate_runs_once() {
    let flight = SingleFlight::<String>::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let first = {
        let runs = runs.clone();
        let release = release.clone();
        flight.launch_if_absent("report:42".to_string(), async move {
            runs.fetch_add(1, Ordering::SeqCst);
            release.notified().await;
            Ok::<(), String>(())
        })
    };
    assert!(first.is_some());
    assert!(flight.is_in_flight(&"report:42".to_string()));

    let duplicate = {
        let runs = runs.clone();
        flight.launch_if_absent("report:42".to_string(), async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
    };
    assert!(duplicate.is_none());

    release.notify_one();
    first.unwrap().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!flight.is_in_flight(&"report:42".to_string()));
}

#[tokio::test]
async fn test_same_key_runs_again_after_completion() {
    let flight = SingleFlight::<&'static str>::new();
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let runs = runs.clone();
        let handle = flight
            .launch_if_absent("refresh", async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .expect("key is free");
        handle.await.unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(flight.in_flight_count(), 0);
}

#[tokio::test]
async fn test_distinct_keys_run_concurrently() {
    let flight = SingleFlight::<u32>::new();
    let release = Arc::new(Notify::new());

    let handles: Vec<_> = (0..4)
        .map(|key| {
            let release = release.clone();
            flight
                .launch_if_absent(key, async move {
                    release.notified().await;
                    Ok::<(), String>(())
                })
                .expect("distinct keys never collide")
        })
        .collect();
    assert_eq!(flight.in_flight_count(), 4);

    // let every task reach its notified() before waking them all
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_waiters();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(flight.in_flight_count(), 0);
}

#[tokio::test]
async fn test_failure_releases_key() {
    let flight = SingleFlight::<&'static str>::new();

    flight
        .launch_if_absent("sync", async { Err::<(), _>("upstream refused") })
        .unwrap()
        .await
        .unwrap();

    assert!(!flight.is_in_flight(&"sync"));
    assert!(flight
        .launch_if_absent("sync", async { Ok::<(), String>(()) })
        .is_some());
}

#[tokio::test]
async fn test_panic_releases_key() {
    let flight = SingleFlight::<&'static str>::new();

    let result = flight
        .launch_if_absent("explode", async {
            if true {
                panic!("work panicked");
            }
            Ok::<(), String>(())
        })
        .unwrap()
        .await;

    assert!(result.unwrap_err().is_panic());
    assert!(!flight.is_in_flight(&"explode"));
    assert!(flight
        .launch_if_absent("explode", async { Ok::<(), String>(()) })
        .is_some());
}

#[tokio::test]
async fn test_explicit_lock_serializes_with_launched_work() {
    let flight = SingleFlight::<&'static str>::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let guard = flight.lock("ledger").await;
    let handle = {
        let order = order.clone();
        flight
            .launch_if_absent("ledger", async move {
                order.lock().unwrap().push("launched");
                Ok::<(), String>(())
            })
            .unwrap()
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    order.lock().unwrap().push("manual");
    drop(guard);
    handle.await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["manual", "launched"]);
}
