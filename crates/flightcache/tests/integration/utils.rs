use std::sync::Arc;
use std::time::Duration;

use flightcache::caching::Cache;
use flightcache::config::CacheConfig;
use flightcache::repository::{Cached, Entity, InMemoryRepository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub name: String,
    pub active: bool,
}

impl Entity for User {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }
}

pub fn user(id: u32, name: &str, active: bool) -> User {
    User {
        id,
        name: name.into(),
        active,
    }
}

pub fn users() -> Vec<User> {
    vec![
        user(1, "ferris", true),
        user(2, "corro", false),
        user(3, "rustacean", true),
    ]
}

/// Creates a cache with default settings and sets up logging.
pub fn setup_cache() -> Cache {
    flightcache_test::setup();
    Cache::new(CacheConfig::default())
}

/// A repository of [`users`] answering every read after `latency`.
pub fn user_repository(latency: Duration) -> Arc<InMemoryRepository<User>> {
    Arc::new(InMemoryRepository::with_entities(users()).with_latency(latency))
}

pub fn cached_users(
    cache: &Cache,
    latency: Duration,
) -> Cached<User, InMemoryRepository<User>> {
    Cached::new(cache.clone(), user_repository(latency))
}
