use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{Entity, Query, Repository, RepositoryError};
use crate::caching::{Cache, CacheError, CacheKey};

/// A [`Repository`] serving reads of whole collections from a [`Cache`].
///
/// - Unparameterized queries are cached under the key of `Vec<T>`.
/// - Queries with an explicit key from [`Query::cached_as`] are cached under that key.
/// - Any other query goes to the repository every time, as its result is not the collection
///   that the type key stands for.
///
/// Single entity lookups are never cached. Every write invalidates the type key and all
/// explicit keys this wrapper has populated. Explicit keys whose entries expired or were
/// evicted are forgotten the next time a new key is used.
pub struct Cached<T, R> {
    cache: Cache,
    repository: Arc<R>,
    explicit_keys: Mutex<HashSet<CacheKey>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, R> Cached<T, R>
where
    T: Entity,
    R: Repository<T> + 'static,
{
    pub fn new(cache: Cache, repository: Arc<R>) -> Self {
        Self {
            cache,
            repository,
            explicit_keys: Default::default(),
            _entity: PhantomData,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Returns the results of `query`, served from the cache where possible.
    pub async fn get_all(&self, query: Query<T>) -> Result<Arc<Vec<T>>, CacheError> {
        let key = match query.cache_key() {
            Some(key) => {
                self.track(key);
                key.clone()
            }
            None if !query.is_parameterized() => Cache::key_for::<Vec<T>>(),
            None => {
                tracing::trace!(?query, "Running parameterized query without cache key");
                let items = self
                    .repository
                    .get(&query)
                    .await
                    .map_err(CacheError::producer)?;
                return Ok(Arc::new(items));
            }
        };

        let repository = Arc::clone(&self.repository);
        self.cache
            .get_or_load(&key, move || async move { repository.get(&query).await })
            .await
    }

    /// Remembers `key` for invalidation, forgetting keys whose entries are gone.
    fn track(&self, key: &CacheKey) {
        let mut explicit_keys = self
            .explicit_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if explicit_keys.contains(key) {
            return;
        }
        explicit_keys.retain(|key| self.cache.contains(key));
        explicit_keys.insert(key.clone());
    }

    /// The number of explicit keys a write would invalidate.
    pub fn tracked_keys(&self) -> usize {
        self.explicit_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every cached read of this collection.
    pub fn invalidate(&self) {
        self.cache.invalidate_by_type::<Vec<T>>();

        let explicit_keys = std::mem::take(
            &mut *self
                .explicit_keys
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for key in &explicit_keys {
            self.cache.invalidate(key);
        }
    }
}

impl<T, R: fmt::Debug> fmt::Debug for Cached<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("type", &std::any::type_name::<T>())
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, R> Repository<T> for Cached<T, R>
where
    T: Entity,
    R: Repository<T> + 'static,
{
    async fn get(&self, query: &Query<T>) -> Result<Vec<T>, RepositoryError> {
        let items = self
            .get_all(query.clone())
            .await
            .map_err(RepositoryError::backend)?;
        Ok(Vec::clone(&items))
    }

    async fn get_by_id(&self, id: &T::Id) -> Result<Option<T>, RepositoryError> {
        self.repository.get_by_id(id).await
    }

    // A failed write may still have reached the backend, so these invalidate either way.

    async fn insert(&self, entity: T) -> Result<(), RepositoryError> {
        let result = self.repository.insert(entity).await;
        self.invalidate();
        result
    }

    async fn update(&self, entity: T) -> Result<(), RepositoryError> {
        let result = self.repository.update(entity).await;
        self.invalidate();
        result
    }

    async fn insert_many(&self, entities: Vec<T>) -> Result<(), RepositoryError> {
        let result = self.repository.insert_many(entities).await;
        self.invalidate();
        result
    }

    async fn update_many(&self, entities: Vec<T>) -> Result<(), RepositoryError> {
        let result = self.repository.update_many(entities).await;
        self.invalidate();
        result
    }

    async fn delete(&self, id: &T::Id) -> Result<(), RepositoryError> {
        let result = self.repository.delete(id).await;
        self.invalidate();
        result
    }

    async fn delete_where(&self, query: &Query<T>) -> Result<usize, RepositoryError> {
        let result = self.repository.delete_where(query).await;
        self.invalidate();
        result
    }
}
