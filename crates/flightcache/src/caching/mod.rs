//! # Caching infrastructure
//!
//! This module contains the read-through cache and everything it is built from.
//!
//! ## Layers
//!
//! - The [`EntryStore`] holds populated entries in memory. Every entry carries an expiration
//!   time, set when it is stored, and a version. Entries past their expiration time are treated
//!   as absent even if they were not physically removed yet.
//! - [`CacheKey`]s are either derived from a Rust type ([`CacheKey::of`]) or supplied by the
//!   caller ([`CacheKey::explicit`]). The two never collide.
//! - The [`SingleFlight`] loader makes sure that, per key, at most one population runs at a
//!   time. Concurrent callers for a missing key wait for the same population instead of
//!   running the producer themselves.
//! - The [`Cache`] ties these together and is the entry point for users.
//!
//! A request goes through the following steps:
//! - First, the store is consulted. A live entry is returned right away.
//! - On miss, the caller joins the running population for the key, if there is one.
//! - Otherwise it spawns a new population, which runs the producer, stores a successful
//!   result and then hands the outcome to everyone waiting for it. Failures are not stored,
//!   the next request starts a fresh population.
//!
//! Producers must return fully materialized values. Values are shared between callers
//! behind an [`Arc`] and are never mutated by the cache.
//!
//! ## Invalidation and staleness
//!
//! [`Cache::invalidate`] removes an entry. A population that is running at that time is not
//! cancelled and will store its result when it finishes, the last write wins.
//!
//! Every population and invalidation bumps the entry version. Callers holding on to a
//! [`CacheEntry`] can check [`Cache::is_current`] to find out whether it was superseded.
//!
//! ## Metrics
//!
//! All metrics are tagged with a `key_kind` field, which is either `type` or `explicit`:
//!
//! - `caches.access`: All accesses to the cache.
//! - `caches.memory.hit`: Accesses served from the store.
//! - `caches.computation`: Populations that were started.
//! - `caches.computation.joined`: Accesses that waited for a running population.
//! - `caches.computation.duration`: Time spent in producers.
//! - `caches.computation.failed`: Failed populations, additionally tagged with `error`.
//! - `caches.timeout`: Callers that gave up waiting.
//! - `caches.invalidate`: Explicit invalidations.
//! - `caches.in_flight`: A gauge of the currently running populations.

use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod cache_error;
mod cache_key;
mod single_flight;
mod store;

pub use cache_error::CacheError;
pub use cache_key::{CacheKey, MAX_EXPLICIT_KEY_LEN};
pub use single_flight::SingleFlight;
pub use store::{CacheEntry, EntryStore, ErasedValue};

use crate::config::CacheConfig;


/// Per-call settings overriding the [`CacheConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// How long a freshly populated entry lives.
    pub ttl: Option<Duration>,
    /// How long this caller waits for a population.
    pub timeout: Option<Duration>,
}

impl LoadOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A read-through cache with single-flight population.
///
/// The cache is created explicitly with [`Cache::new`] and torn down with
/// [`Cache::shutdown`]. Clones share the same entries.
///
/// All loading methods spawn the population on the current tokio runtime, so they must be
/// called from within one.
#[derive(Debug, Clone)]
pub struct Cache {
    config: CacheConfig,
    store: Arc<EntryStore>,
    loader: SingleFlight,
    shut_down: Arc<AtomicBool>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(EntryStore::new(config.max_entries));
        let loader = SingleFlight::new(Arc::clone(&store));

        tracing::debug!(?config, "Creating in-memory cache");

        Self {
            config,
            store,
            loader,
            shut_down: Default::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The key derived from the type `T`.
    pub fn key_for<T: ?Sized + 'static>() -> CacheKey {
        CacheKey::of::<T>()
    }

    /// Returns the value under `key`, populating it with `producer` using the default TTL.
    pub async fn get_or_load<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        producer: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.get_or_load_with(key, LoadOptions::default(), producer)
            .await
    }

    /// Returns the value under `key`, populating it with `producer` for the given `ttl`.
    pub async fn get_or_load_with_ttl<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        producer: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.get_or_load_with(key, LoadOptions::default().with_ttl(ttl), producer)
            .await
    }

    /// Returns the value cached under the key of its own type `T`.
    pub async fn get_or_load_typed<T, F, Fut, E>(&self, producer: F) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.get_or_load(&Self::key_for::<T>(), producer).await
    }

    pub async fn get_or_load_with<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        options: LoadOptions,
        producer: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let entry = self.get_entry(key, options, producer).await?;
        Ok(entry.into_value())
    }

    /// Like [`get_or_load_with`](Self::get_or_load_with), but returns the whole entry
    /// including its version.
    ///
    /// # Errors
    ///
    /// - [`CacheError::ProducerFailure`] if the population this caller waited for failed.
    /// - [`CacheError::Timeout`] if the caller gave up waiting.
    /// - [`CacheError::TypeMismatch`] if the key holds a value of another type.
    /// - [`CacheError::Shutdown`] if the cache was shut down.
    pub async fn get_entry<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        options: LoadOptions,
        producer: F,
    ) -> Result<CacheEntry<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let producer = move || async move {
            match producer().await {
                Ok(value) => Ok(Arc::new(value) as ErasedValue),
                Err(err) => Err(CacheError::producer(err)),
            }
        };

        self.load_erased(key, options, producer).await?.downcast()
    }

    /// Returns the value under `key`, populating it with a blocking `producer`.
    ///
    /// The producer runs on the blocking thread pool of the runtime, so blocking I/O in it
    /// only holds up the callers waiting for this key.
    pub async fn get_or_load_blocking<T, F, E>(
        &self,
        key: &CacheKey,
        options: LoadOptions,
        producer: F,
    ) -> Result<Arc<T>, CacheError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync + 'static>> + Send + 'static,
    {
        let producer = move || async move {
            match tokio::task::spawn_blocking(producer).await {
                Ok(Ok(value)) => Ok(Arc::new(value) as ErasedValue),
                Ok(Err(err)) => Err(CacheError::producer(err)),
                // re-raise, so the population is reported like any other panicking producer
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(CacheError::Shutdown),
            }
        };

        let entry = self.load_erased(key, options, producer).await?.downcast()?;
        Ok(entry.into_value())
    }

    async fn load_erased<F, Fut>(
        &self,
        key: &CacheKey,
        options: LoadOptions,
        producer: F,
    ) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ErasedValue, CacheError>> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(CacheError::Shutdown);
        }
        metric!(counter("caches.access") += 1, "key_kind" => key.kind());

        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let load = self.loader.load(key, ttl, producer);

        let Some(timeout) = options.timeout.or(self.config.load_timeout) else {
            return load.await;
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%key, ?timeout, "Gave up waiting for cache population");
                metric!(counter("caches.timeout") += 1, "key_kind" => key.kind());
                Err(CacheError::Timeout(timeout))
            }
        }
    }

    /// Returns the value under `key` without populating it.
    pub fn get<T: Any + Send + Sync>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, CacheError> {
        if self.is_shut_down() {
            return Err(CacheError::Shutdown);
        }
        self.store
            .get(key)
            .map(|entry| entry.downcast::<T>().map(CacheEntry::into_value))
            .transpose()
    }

    /// Whether `key` holds a live entry or is being populated right now.
    pub fn contains(&self, key: &CacheKey) -> bool {
        !self.is_shut_down() && (self.store.get(key).is_some() || self.loader.is_in_flight(key))
    }

    /// Removes the entry under `key`.
    ///
    /// A population for `key` that is running right now is not cancelled, and its result
    /// will be stored once it finishes.
    pub fn invalidate(&self, key: &CacheKey) {
        tracing::trace!(%key, "Invalidating cache entry");
        metric!(counter("caches.invalidate") += 1, "key_kind" => key.kind());
        self.store.remove(key);
    }

    /// Removes the entry under the key derived from `T`.
    pub fn invalidate_by_type<T: ?Sized + 'static>(&self) {
        self.invalidate(&Self::key_for::<T>())
    }

    /// Whether `entry` is still the live entry under its key.
    ///
    /// Nothing is current once the cache was shut down.
    pub fn is_current<T: ?Sized>(&self, entry: &CacheEntry<T>) -> bool {
        !self.is_shut_down() && self.store.version_of(entry.key()) == Some(entry.version())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Tears the cache down.
    ///
    /// Running populations are aborted and their waiters receive [`CacheError::Shutdown`].
    /// A population that finishes anyway does not store its result. All entries are dropped
    /// and every later call fails with [`CacheError::Shutdown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // closes the loader first, so nothing is published into the cleared store
        let aborted = self.loader.shutdown();
        self.store.clear();

        tracing::info!(aborted, "Cache shut down");
    }
}
