use std::sync::Arc;
use std::time::Duration;

use flightcache::caching::{Cache, CacheKey};
use flightcache::repository::{
    Cached, InMemoryRepository, Query, Repository, RepositoryError, UnitOfWork,
};

use crate::{User, cached_users, setup_cache, user, users};

#[tokio::test]
async fn test_unit_of_work_with_cached_reads() {
    let cache = setup_cache();
    let unit = UnitOfWork::new(|| Ok(InMemoryRepository::with_entities(users())));

    let repository = Arc::clone(unit.repository().unwrap());
    let cached = Cached::new(cache.clone(), repository);

    let before = cached.get_all(Query::all()).await.unwrap();
    assert_eq!(before.len(), 3);

    cached.update(user(2, "corro", true)).await.unwrap();

    let after = cached.get_all(Query::all()).await.unwrap();
    assert!(after.iter().all(|u| u.active));
    // the snapshot handed out before the write is untouched
    assert!(!before[1].active);
    assert_eq!(cached.repository().query_count(), 2);

    drop(unit);
    // the cached wrapper keeps the repository alive on its own
    assert_eq!(cached.get_all(Query::all()).await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_collection_reads() {
    let cache = setup_cache();
    let cached = Arc::new(cached_users(&cache, Duration::from_millis(50)));

    let tasks: Vec<_> = (0..30)
        .map(|_| {
            let cached = Arc::clone(&cached);
            tokio::spawn(async move { cached.get_all(Query::all()).await })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        assert_eq!(*task.unwrap().unwrap(), users());
    }
    assert_eq!(cached.repository().query_count(), 1);
}

#[tokio::test]
async fn test_keyed_and_unkeyed_queries() {
    let cache = setup_cache();
    let cached = cached_users(&cache, Duration::ZERO);
    let active_key = CacheKey::explicit("users:active").unwrap();

    let active = || {
        Query::all()
            .filter(|u: &User| u.active)
            .order_by_key(|u| u.name.clone())
    };

    for _ in 0..3 {
        let keyed = cached
            .get_all(active().cached_as(active_key.clone()))
            .await
            .unwrap();
        let names: Vec<_> = keyed.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["ferris", "rustacean"]);
    }
    assert_eq!(cached.repository().query_count(), 1);

    for _ in 0..3 {
        cached.get_all(active()).await.unwrap();
    }
    assert_eq!(cached.repository().query_count(), 4);

    // neither query populated the collection key
    assert!(
        cache
            .get::<Vec<User>>(&Cache::key_for::<Vec<User>>())
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_writes_through_the_trait() {
    let cache = setup_cache();
    let cached = cached_users(&cache, Duration::ZERO);

    // `Cached` is a repository itself
    async fn add(repository: &dyn Repository<User>, entity: User) -> Result<(), RepositoryError> {
        repository.insert(entity).await
    }

    assert_eq!(cached.get(&Query::all()).await.unwrap().len(), 3);
    add(&cached, user(4, "crab", false)).await.unwrap();
    assert!(matches!(
        add(&cached, user(4, "crab", false)).await,
        Err(RepositoryError::Conflict(_))
    ));

    cached.delete(&1).await.unwrap();
    let remaining = cached.get(&Query::all()).await.unwrap();
    let ids: Vec<_> = remaining.iter().map(|u| u.id).collect();
    assert_eq!(ids, [2, 3, 4]);
}

#[tokio::test]
async fn test_backend_failure_is_not_cached() {
    let cache = setup_cache();
    let unit = UnitOfWork::<InMemoryRepository<User>>::new(|| {
        Err(RepositoryError::backend("database is down"))
    });

    assert!(matches!(
        unit.repository(),
        Err(RepositoryError::Backend(_))
    ));
    assert!(!unit.is_open());
    assert_eq!(
        cache.get::<Vec<User>>(&Cache::key_for::<Vec<User>>()).unwrap(),
        None
    );
}
