use std::sync::Arc;
use std::time::Duration;

use flightcache::caching::{Cache, CacheError, CacheKey, LoadOptions};
use flightcache::repository::{Query, Repository};
use flightcache_test::{Calls, TestError};

use crate::{User, setup_cache, user_repository, users};

/// Fifty concurrent requests for a slow query share one execution.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_loaded_once() {
    let cache = setup_cache();
    let repository = user_repository(Duration::from_millis(100));
    let key = CacheKey::explicit("users").unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let repository = Arc::clone(&repository);
            tokio::spawn(async move {
                cache
                    .get_or_load_with_ttl(&key, Duration::from_secs(5 * 60), move || async move {
                        repository.get(&Query::all()).await
                    })
                    .await
            })
        })
        .collect();

    let results: Vec<Arc<Vec<User>>> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|task| task.unwrap().unwrap())
        .collect();

    assert_eq!(repository.query_count(), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    assert_eq!(*results[0], users());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_keys_many_callers() {
    let cache = setup_cache();
    let calls = Calls::new();

    let tasks: Vec<_> = (0..20)
        .flat_map(|k| (0..10).map(move |_| k))
        .map(|k| {
            let cache = cache.clone();
            let producer = calls.slow_producer(Duration::from_millis(50), k);
            tokio::spawn(async move {
                let key = CacheKey::explicit(format!("key-{k}")).unwrap();
                cache.get_or_load(&key, producer).await
            })
        })
        .collect();

    for (i, task) in futures::future::join_all(tasks).await.into_iter().enumerate() {
        assert_eq!(*task.unwrap().unwrap(), i / 10);
    }
    assert_eq!(calls.count(), 20);
}

#[tokio::test]
async fn test_failing_producer_is_retried() {
    let cache = setup_cache();
    let calls = Calls::new();

    let err = cache
        .get_or_load_typed(calls.flaky_producer(users()))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::ProducerFailure(_)));
    assert!(
        cache
            .get::<Vec<User>>(&Cache::key_for::<Vec<User>>())
            .unwrap()
            .is_none()
    );

    let second = cache
        .get_or_load_typed(calls.flaky_producer(users()))
        .await
        .unwrap();
    let third = cache
        .get_or_load_typed(calls.flaky_producer(users()))
        .await
        .unwrap();

    assert_eq!(calls.count(), 2);
    assert!(Arc::ptr_eq(&second, &third));
}

#[tokio::test]
async fn test_type_and_explicit_keys_are_disjoint() {
    let cache = setup_cache();
    let calls = Calls::new();

    // an explicit key spelled like the type key
    let lookalike = CacheKey::explicit(format!("type:{}", std::any::type_name::<u32>())).unwrap();
    assert_ne!(lookalike, Cache::key_for::<u32>());

    cache.get_or_load_typed(calls.producer(1u32)).await.unwrap();
    let value = cache.get_or_load(&lookalike, calls.producer(2u32)).await.unwrap();

    assert_eq!(*value, 2);
    assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_timed_out_callers_do_not_cancel() {
    let cache = setup_cache();
    let key = CacheKey::explicit("report").unwrap();
    let calls = Calls::new();

    let impatient = LoadOptions::default().with_timeout(Duration::from_millis(10));
    for _ in 0..3 {
        let err = cache
            .get_or_load_with(
                &key,
                impatient,
                calls.slow_producer(Duration::from_millis(100), "done"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    // the one population still finished and stored its result
    assert_eq!(cache.get::<&str>(&key).unwrap().as_deref(), Some(&"done"));
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_errors_reach_callers_unchanged() {
    let cache = setup_cache();
    let key = CacheKey::explicit("broken").unwrap();
    let calls = Calls::new();

    let err = cache
        .get_or_load(&key, calls.failing_producer::<u8>("disk on fire"))
        .await
        .unwrap_err();

    let source = err.producer_error().unwrap();
    assert_eq!(
        source.downcast_ref::<TestError>(),
        Some(&TestError("disk on fire".into()))
    );
}

#[test]
fn test_invalid_keys_are_rejected() {
    for key in ["", "   ", "line\nbreak"] {
        assert!(matches!(
            CacheKey::explicit(key),
            Err(CacheError::InvalidKey(_))
        ));
    }
    assert!(CacheKey::explicit("x".repeat(251)).is_err());
}

#[tokio::test]
async fn test_shutdown_is_shared_by_clones() {
    let cache = setup_cache();
    let clone = cache.clone();
    let calls = Calls::new();

    clone.shutdown();

    assert!(cache.is_shut_down());
    let err = cache.get_or_load_typed(calls.producer(1u8)).await.unwrap_err();
    assert!(matches!(err, CacheError::Shutdown));
    assert_eq!(calls.count(), 0);
}
