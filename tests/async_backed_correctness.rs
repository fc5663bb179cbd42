#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use deep_fs::cache::async_backed::{FutureBackedCache, Peek};
use tokio::task::JoinSet;

#[tokio::test]
async fn ok_value_is_cached() {
    let cache = FutureBackedCache::<u64, String, &'static str>::default();
    let v = cache
        .get_or_try_init(1, || async { Ok("hello".to_owned()) })
        .await
        .unwrap();
    assert_eq!(v, "hello");

    assert_eq!(cache.get(&1).await.unwrap(), "hello");
    assert_eq!(cache.peek(&1), Peek::Ready("hello".to_owned()));
}

#[tokio::test]
async fn error_is_not_cached() {
    let cache = FutureBackedCache::<u64, String, &'static str>::default();
    let err = cache
        .get_or_try_init(1, || async { Err("boom") })
        .await
        .unwrap_err();
    assert_eq!(*err, "boom");

    assert!(cache.is_empty());
    assert_eq!(cache.peek(&1), Peek::Absent);
    assert!(cache.get(&1).await.is_none());
}

#[tokio::test]
async fn error_then_retry_ok() {
    let cache = FutureBackedCache::<u64, String, &'static str>::default();

    let r1 = cache.get_or_try_init(1, || async { Err("fail") }).await;
    assert!(r1.is_err());

    let r2 = cache
        .get_or_try_init(1, || async { Ok("recovered".to_owned()) })
        .await;
    assert_eq!(r2.unwrap(), "recovered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_run_one_factory() {
    let cache = Arc::new(FutureBackedCache::<u64, u64, &'static str>::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        set.spawn(async move {
            cache
                .get_or_try_init(7, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(49)
                    }
                })
                .await
                .unwrap()
        });
    }
    while let Some(v) = set.join_next().await {
        assert_eq!(v.unwrap(), 49);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joiners_share_the_error() {
    let cache = Arc::new(FutureBackedCache::<u64, u64, String>::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        set.spawn(async move {
            cache
                .get_or_try_init(1, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err("corrupt".to_owned())
                    }
                })
                .await
        });
    }
    while let Some(res) = set.join_next().await {
        assert_eq!(res.unwrap().unwrap_err().as_str(), "corrupt");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn remove_if_respects_predicate() {
    let cache = FutureBackedCache::<u64, u64, &'static str>::default();
    cache.get_or_try_init(1, || async { Ok(10) }).await.unwrap();

    assert!(!cache.remove_if(&1, |v| *v == 11));
    assert!(cache.contains(&1));
    assert!(cache.remove_if(&1, |v| *v == 10));
    assert!(!cache.contains(&1));
}

#[tokio::test]
async fn panic_in_factory_is_recovered() {
    let cache = Arc::new(FutureBackedCache::<u64, String, &'static str>::default());
    let call_count = Arc::new(AtomicUsize::new(0));

    let cache2 = Arc::clone(&cache);
    let call_count2 = Arc::clone(&call_count);
    let handle = tokio::spawn(async move {
        cache2
            .get_or_try_init(1, || {
                call_count2.fetch_add(1, Ordering::Relaxed);
                async { panic!("boom") }
            })
            .await
    });
    assert!(handle.await.is_err(), "task should have panicked");

    let v = cache
        .get_or_try_init(1, || {
            call_count.fetch_add(1, Ordering::Relaxed);
            async { Ok("recovered".to_owned()) }
        })
        .await
        .unwrap();
    assert_eq!(v, "recovered");
    assert_eq!(call_count.load(Ordering::Relaxed), 2);
}
