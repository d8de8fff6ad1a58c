use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;

use super::{CacheEntry, CacheError, CacheKey, EntryStore, ErasedValue};

/// The outcome of one population, shared by every caller waiting for it.
type Computation = Shared<BoxFuture<'static, Result<CacheEntry, CacheError>>>;

/// A population that is currently running.
struct InFlight {
    /// Distinguishes this population from later ones for the same key.
    id: u64,
    computation: Computation,
    /// Set once the population task was spawned.
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    running: HashMap<CacheKey, InFlight>,
    /// Once set, populations neither start nor publish.
    closed: bool,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // The registry is consistent after every single operation, so a panic elsewhere does not
    // leave it in a broken state.
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a population from the registry once its outcome was published.
///
/// This lives inside the spawned population task, so it also runs when the task is aborted or
/// dropped by a runtime that is shutting down.
struct Deregister {
    registry: Arc<Mutex<Registry>>,
    key: CacheKey,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        if registry
            .running
            .get(&self.key)
            .is_some_and(|f| f.id == self.id)
        {
            registry.running.remove(&self.key);
        }
        metric!(gauge("caches.in_flight") = registry.running.len() as u64);
    }
}

/// What a caller found when asking for an entry.
enum Lookup {
    /// A live entry.
    Hit(CacheEntry),
    /// A running population, which this caller either started or joined.
    Wait(Computation),
}

/// Coordinates populations of the [`EntryStore`] so that every key is computed at most once
/// at a time.
///
/// Concurrent callers asking for the same missing key all wait for one population. Callers
/// for different keys never wait for each other: the registry of running populations is only
/// locked for single map operations, never while a producer runs.
///
/// Populations run as spawned tokio tasks and hand their outcome to the waiting callers
/// through a channel. Dropping or timing out the future of a waiting caller therefore never
/// cancels the population, the other callers still get its result and a successful result is
/// still stored.
#[derive(Clone)]
pub struct SingleFlight {
    store: Arc<EntryStore>,
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for SingleFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .registry
            .try_lock()
            .map(|r| r.running.len())
            .unwrap_or_default();
        f.debug_struct("SingleFlight")
            .field("store", &self.store)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl SingleFlight {
    pub fn new(store: Arc<EntryStore>) -> Self {
        Self {
            store,
            registry: Default::default(),
            next_id: Default::default(),
        }
    }

    /// Returns the live entry under `key`, or populates it using `producer`.
    ///
    /// `producer` is only invoked if no entry exists and no population for `key` is running.
    /// A successful result is stored for `ttl`. A failure is handed to every caller that
    /// waited for this population and is not stored, so the next call starts over.
    ///
    /// Fails with [`CacheError::Shutdown`] after [`shutdown`](Self::shutdown), and when the
    /// runtime drops the population before it finished.
    pub async fn load<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        producer: F,
    ) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ErasedValue, CacheError>> + Send + 'static,
    {
        match self.lookup_or_start(key, ttl, producer)? {
            Lookup::Hit(entry) => Ok(entry),
            Lookup::Wait(computation) => computation.await,
        }
    }

    fn lookup_or_start<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        producer: F,
    ) -> Result<Lookup, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ErasedValue, CacheError>> + Send + 'static,
    {
        let kind = key.kind();

        if let Some(entry) = self.store.get(key) {
            metric!(counter("caches.memory.hit") += 1, "key_kind" => kind);
            return Ok(Lookup::Hit(entry));
        }

        let mut registry = lock(&self.registry);

        if registry.closed {
            return Err(CacheError::Shutdown);
        }

        if let Some(running) = registry.running.get(key) {
            tracing::trace!(%key, "Joining running cache population");
            metric!(counter("caches.computation.joined") += 1, "key_kind" => kind);
            return Ok(Lookup::Wait(running.computation.clone()));
        }

        // A population may have been published and deregistered between our first lookup
        // and taking the lock.
        if let Some(entry) = self.store.get(key) {
            metric!(counter("caches.memory.hit") += 1, "key_kind" => kind);
            return Ok(Lookup::Hit(entry));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel::<Result<CacheEntry, CacheError>>();
        // The sender is dropped without a value if the task is aborted or never runs.
        let computation = receiver
            .map(|outcome| outcome.unwrap_or(Err(CacheError::Shutdown)))
            .boxed()
            .shared();

        registry.running.insert(
            key.clone(),
            InFlight {
                id,
                computation: computation.clone(),
                abort: None,
            },
        );
        metric!(gauge("caches.in_flight") = registry.running.len() as u64);

        // Spawning may drop the task right away, and dropping it deregisters.
        drop(registry);

        tracing::trace!(%key, "Spawning cache population");
        metric!(counter("caches.computation") += 1, "key_kind" => kind);

        let deregister = Deregister {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            id,
        };
        let store = Arc::clone(&self.store);

        let task = tokio::spawn(async move {
            let start = Instant::now();
            let result = AssertUnwindSafe(async move { producer().await })
                .catch_unwind()
                .await;
            metric!(timer("caches.computation.duration") = start.elapsed(), "key_kind" => kind);

            let key = &deregister.key;
            let outcome = match result {
                Ok(Ok(value)) => publish(&deregister.registry, &store, key, value, ttl),
                Ok(Err(err)) => {
                    tracing::debug!(%key, error = %err, "Cache population failed");
                    metric!(
                        counter("caches.computation.failed") += 1,
                        "key_kind" => kind,
                        "error" => err.metrics_tag(),
                    );
                    Err(err)
                }
                Err(_) => {
                    tracing::error!(%key, "Cache population panicked");
                    metric!(
                        counter("caches.computation.failed") += 1,
                        "key_kind" => kind,
                        "error" => CacheError::InternalError.metrics_tag(),
                    );
                    Err(CacheError::InternalError)
                }
            };

            // waiters must not find the finished population still registered
            drop(deregister);
            // every waiter may have given up already
            let _ = sender.send(outcome);
        });

        let abort = task.abort_handle();
        let mut registry = lock(&self.registry);
        if registry.closed {
            abort.abort();
        } else if let Some(running) = registry.running.get_mut(key).filter(|f| f.id == id) {
            running.abort = Some(abort);
        }

        Ok(Lookup::Wait(computation))
    }

    /// Whether a population for `key` is currently running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        lock(&self.registry).running.contains_key(key)
    }

    /// The number of populations currently running.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.registry).running.len()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.registry).closed
    }

    /// Aborts all running populations and refuses to start or publish any further ones.
    ///
    /// Waiters receive [`CacheError::Shutdown`]. Returns the number of aborted populations.
    pub fn shutdown(&self) -> usize {
        let running = {
            let mut registry = lock(&self.registry);
            registry.closed = true;
            std::mem::take(&mut registry.running)
        };

        // Aborting drops the task, whose `Deregister` needs the lock again.
        for (key, flight) in &running {
            tracing::debug!(%key, "Aborting cache population");
            if let Some(abort) = &flight.abort {
                abort.abort();
            }
        }

        running.len()
    }
}

/// Stores the result of a population unless the loader was shut down.
///
/// Runs under the registry lock, so an entry is either stored before [`SingleFlight::shutdown`]
/// closes the registry, or discarded.
fn publish(
    registry: &Mutex<Registry>,
    store: &EntryStore,
    key: &CacheKey,
    value: ErasedValue,
    ttl: Duration,
) -> Result<CacheEntry, CacheError> {
    let registry = lock(registry);
    if registry.closed {
        tracing::debug!(%key, "Discarding cache population after shutdown");
        return Err(CacheError::Shutdown);
    }
    Ok(store.put(key.clone(), value, ttl))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn loader() -> SingleFlight {
        SingleFlight::new(Arc::new(EntryStore::new(None)))
    }

    fn counting_producer(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<ErasedValue, CacheError>> + Send + 'static
    {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Arc::new(value) as ErasedValue)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_run_once() {
        let loader = loader();
        let key = CacheKey::explicit("shared").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let loads = (0..10).map(|i| {
            let producer = counting_producer(&calls, Duration::from_millis(50), i);
            loader.load(&key, ttl, producer)
        });
        let results = futures::future::join_all(loads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let versions: Vec<_> = results
            .into_iter()
            .map(|result| result.unwrap().version())
            .collect();
        assert!(versions.windows(2).all(|w| w[0] == w[1]));
        assert!(!loader.is_in_flight(&key));
    }

    #[tokio::test]
    async fn test_failure_is_not_stored() {
        let loader = loader();
        let key = CacheKey::explicit("flaky").unwrap();
        let ttl = Duration::from_secs(60);

        let err = loader
            .load(&key, ttl, || async { Err(CacheError::producer("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ProducerFailure(_)));
        assert!(!loader.is_in_flight(&key));
        assert!(loader.store.get(&key).is_none());

        let entry = loader
            .load(&key, ttl, || async { Ok(Arc::new("ok") as ErasedValue) })
            .await
            .unwrap();
        assert_eq!(*entry.downcast::<&str>().unwrap().into_value(), "ok");
    }

    #[tokio::test]
    async fn test_panicking_producer() {
        let loader = loader();
        let key = CacheKey::explicit("panics").unwrap();

        let err = loader
            .load(&key, Duration::from_secs(60), || async {
                let explode = true;
                if explode {
                    panic!("producer blew up");
                }
                Ok(Arc::new(()) as ErasedValue)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::InternalError));
        assert!(!loader.is_in_flight(&key));
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts() {
        let loader = loader();
        let key = CacheKey::explicit("slow").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let load = tokio::spawn({
            let loader = loader.clone();
            let key = key.clone();
            let producer = counting_producer(&calls, Duration::from_secs(3600), 1);
            async move { loader.load(&key, Duration::from_secs(60), producer).await }
        });

        while !loader.is_in_flight(&key) {
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.shutdown(), 1);
        assert!(loader.is_shut_down());

        let err = load.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Shutdown));
        assert!(loader.store.get(&key).is_none());

        // nothing starts anymore
        let err = loader
            .load(&key, Duration::from_secs(60), counting_producer(&calls, Duration::ZERO, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Shutdown));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_result_after_shutdown_is_discarded() {
        let loader = loader();
        let key = CacheKey::explicit("torn-down").unwrap();

        let err = loader
            .load(&key, Duration::from_secs(60), {
                let loader = loader.clone();
                move || async move {
                    // the producer is already past any point where aborting could stop it
                    loader.shutdown();
                    Ok(Arc::new(7u32) as ErasedValue)
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Shutdown));
        assert!(loader.store.get(&key).is_none());
        assert!(!loader.is_in_flight(&key));
    }

    #[test]
    fn test_load_on_closed_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);

        let loader = loader();
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn({
            let loader = loader.clone();
            move || {
                let key = CacheKey::explicit("closed").unwrap();
                let result = handle.block_on(loader.load(&key, Duration::from_secs(60), || async {
                    Ok(Arc::new(1u8) as ErasedValue)
                }));
                let _ = sender.send(result.map(|entry| entry.version()));
            }
        });

        let result = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("loading on a closed runtime must not hang");
        assert!(matches!(result, Err(CacheError::Shutdown)));
        assert_eq!(loader.in_flight_count(), 0);
    }
}
