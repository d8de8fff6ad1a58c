//! The data-access boundary the cache wraps.
//!
//! A [`Repository`] executes [`Query`]s against some backing store and applies writes to it.
//! The cache never talks to the backing store itself. [`Cached`] wraps a repository and serves
//! whole-collection reads from a [`Cache`](crate::caching::Cache), invalidating them whenever
//! it writes.
//!
//! A [`UnitOfWork`] owns the connection to the backing store and lazily opens a repository on
//! top of it.

use std::cmp::Ordering;
use std::error::Error as StdError;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::caching::CacheKey;

mod cached;
mod memory;

pub use cached::Cached;
pub use memory::InMemoryRepository;

/// A record stored in a [`Repository`].
pub trait Entity: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
}

/// Errors returned by a [`Repository`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The entity to update or delete does not exist.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// An entity with the same id already exists.
    #[error("entity already exists: {0}")]
    Conflict(String),

    /// The backing store failed.
    #[error("repository backend failed")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl RepositoryError {
    pub fn backend<E: Into<Box<dyn StdError + Send + Sync>>>(err: E) -> Self {
        Self::Backend(err.into())
    }
}

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Order<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// A read query, applied as filter, then ordering, then `skip`, then `take`.
///
/// A query without any of those is "unparameterized" and returns the whole collection. Only
/// such queries may be cached under the key of the collection type. Parameterized queries
/// need an explicit key given with [`Query::cached_as`] to be cached at all.
pub struct Query<T> {
    filter: Option<Filter<T>>,
    order: Option<Order<T>>,
    skip: Option<usize>,
    take: Option<usize>,
    cache_key: Option<CacheKey>,
}

impl<T> Query<T> {
    /// A query returning every entity.
    pub fn all() -> Self {
        Self {
            filter: None,
            order: None,
            skip: None,
            take: None,
            cache_key: None,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn order_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(compare));
        self
    }

    /// Orders by the key extracted with `f`.
    pub fn order_by_key<K, F>(self, f: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.order_by(move |a, b| f(a).cmp(&f(b)))
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    /// Caches the results of this query under `key`.
    pub fn cached_as(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    /// Whether this query narrows down or reorders the collection.
    pub fn is_parameterized(&self) -> bool {
        self.filter.is_some() || self.order.is_some() || self.skip.is_some() || self.take.is_some()
    }

    /// Runs this query over `items`.
    pub fn apply<I>(&self, items: I) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut items: Vec<T> = match &self.filter {
            Some(filter) => items.into_iter().filter(|item| filter(item)).collect(),
            None => items.into_iter().collect(),
        };

        if let Some(order) = &self.order {
            items.sort_by(|a, b| order(a, b));
        }

        items
            .into_iter()
            .skip(self.skip.unwrap_or(0))
            .take(self.take.unwrap_or(usize::MAX))
            .collect()
    }
}

impl<T> Default for Query<T> {
    fn default() -> Self {
        Self::all()
    }
}

// Not derived, as that would require `T: Clone`.
impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            order: self.order.clone(),
            skip: self.skip,
            take: self.take,
            cache_key: self.cache_key.clone(),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("filter", &self.filter.is_some())
            .field("order", &self.order.is_some())
            .field("skip", &self.skip)
            .field("take", &self.take)
            .field("cache_key", &self.cache_key)
            .finish()
    }
}

/// Reads and writes entities of type `T` in a backing store.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Returns all entities matching `query`, fully materialized.
    async fn get(&self, query: &Query<T>) -> Result<Vec<T>, RepositoryError>;

    async fn get_by_id(&self, id: &T::Id) -> Result<Option<T>, RepositoryError>;

    /// Adds a new entity, failing with [`RepositoryError::Conflict`] if its id is taken.
    async fn insert(&self, entity: T) -> Result<(), RepositoryError>;

    /// Replaces an existing entity, failing with [`RepositoryError::NotFound`] otherwise.
    async fn update(&self, entity: T) -> Result<(), RepositoryError>;

    /// Adds all `entities`, or none of them if any id is taken.
    async fn insert_many(&self, entities: Vec<T>) -> Result<(), RepositoryError>;

    /// Replaces all `entities`, or none of them if any does not exist.
    async fn update_many(&self, entities: Vec<T>) -> Result<(), RepositoryError>;

    async fn delete(&self, id: &T::Id) -> Result<(), RepositoryError>;

    /// Removes every entity `query` returns and reports how many were removed.
    ///
    /// The whole query applies, so `order_by` with `take` removes the first few in that order.
    async fn delete_where(&self, query: &Query<T>) -> Result<usize, RepositoryError>;
}

type Factory<R> = Box<dyn Fn() -> Result<R, RepositoryError> + Send + Sync>;

/// Owns the connection to a backing store for the duration of one unit of work.
///
/// The repository is opened on first access and disposed together with the unit of work.
pub struct UnitOfWork<R> {
    open: Factory<R>,
    repository: OnceLock<Arc<R>>,
}

impl<R> UnitOfWork<R> {
    /// Creates a unit of work that opens its repository with `open`.
    pub fn new<F>(open: F) -> Self
    where
        F: Fn() -> Result<R, RepositoryError> + Send + Sync + 'static,
    {
        Self {
            open: Box::new(open),
            repository: OnceLock::new(),
        }
    }

    /// Returns the repository, opening it if this is the first access.
    pub fn repository(&self) -> Result<&Arc<R>, RepositoryError> {
        if let Some(repository) = self.repository.get() {
            return Ok(repository);
        }

        let repository = Arc::new((self.open)()?);
        tracing::trace!("Opened unit of work repository");
        Ok(self.repository.get_or_init(|| repository))
    }

    /// Whether the repository was opened.
    pub fn is_open(&self) -> bool {
        self.repository.get().is_some()
    }
}

impl<R> fmt::Debug for UnitOfWork<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl<R> Drop for UnitOfWork<R> {
    fn drop(&mut self) {
        if self.repository.take().is_some() {
            tracing::trace!("Disposed unit of work repository");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;

    #[test]
    fn test_query_apply() {
        let query = Query::all()
            .filter(|n: &u32| n % 2 == 0)
            .order_by(|a, b| b.cmp(a))
            .skip(1)
            .take(2);

        assert!(query.is_parameterized());
        assert_eq!(query.apply(0..10), vec![6, 4]);
    }

    #[test]
    fn test_unparameterized_query() {
        let query = Query::<u32>::all();
        assert!(!query.is_parameterized());
        assert_eq!(query.apply([3, 1, 2]), vec![3, 1, 2]);

        // a cache key alone does not narrow anything down
        let query = query.cached_as(CacheKey::explicit("numbers").unwrap());
        assert!(!query.is_parameterized());
        assert!(query.cache_key().is_some());
    }

    #[test]
    fn test_skip_past_end() {
        let query = Query::all().order_by_key(|n: &i64| -n).skip(5);
        assert_eq!(query.apply([1, 2, 3]), Vec::<i64>::new());
    }

    #[test]
    fn test_unit_of_work_opens_lazily() {
        let opened = Arc::new(AtomicUsize::new(0));
        let unit = UnitOfWork::new({
            let opened = Arc::clone(&opened);
            move || {
                opened.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(InMemoryRepository::<u32>::new())
            }
        });

        assert!(!unit.is_open());
        assert_eq!(opened.load(AtomicOrdering::SeqCst), 0);

        let first = Arc::clone(unit.repository().unwrap());
        let second = unit.repository().unwrap();
        assert!(Arc::ptr_eq(&first, second));
        assert!(unit.is_open());
        assert_eq!(opened.load(AtomicOrdering::SeqCst), 1);

        drop(unit);
        // the unit of work released its handle
        assert_eq!(Arc::strong_count(&first), 1);
    }

    #[test]
    fn test_unit_of_work_open_failure() {
        let unit = UnitOfWork::<InMemoryRepository<u32>>::new(|| {
            Err(RepositoryError::backend("connection refused"))
        });

        let err = unit.repository().unwrap_err();
        assert!(matches!(err, RepositoryError::Backend(_)));
        assert!(!unit.is_open());
    }
}
