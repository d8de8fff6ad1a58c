use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flightcache::caching::{Cache, CacheError, CacheKey, LoadOptions};
use flightcache::repository::{Cached, Entity, InMemoryRepository, Query, Repository};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,

    /// How long every producer invocation takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,

    /// Time-to-live of populated entries, defaults to the configured one.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// Every n-th producer invocation fails.
    #[serde(default)]
    pub fail_every: Option<usize>,

    /// Every n-th operation invalidates what it just read.
    #[serde(default)]
    pub invalidate_every: Option<usize>,

    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Spreads requests over this many explicit keys.
    Keys(usize),
    /// Reads the whole collection of a repository holding this many entities.
    Repository(usize),
}

#[derive(Debug, thiserror::Error)]
#[error("simulated producer failure")]
struct SimulatedFailure;

#[derive(Debug, Clone)]
struct Item {
    id: usize,
    revision: u64,
}

impl Entity for Item {
    type Id = usize;

    fn id(&self) -> usize {
        self.id
    }
}

enum Target {
    Keys(Vec<CacheKey>),
    Repository(Cached<Item, InMemoryRepository<Item>>),
}

/// A workload ready to run against a cache.
pub struct PreparedWorkload {
    cache: Cache,
    target: Target,
    options: LoadOptions,
    latency: Duration,
    fail_every: Option<usize>,
    invalidate_every: Option<usize>,
    operations: AtomicUsize,
    invocations: Arc<AtomicUsize>,
    failures: AtomicUsize,
}

/// Counters collected while running a workload.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadStats {
    pub invocations: usize,
    pub failures: usize,
}

pub fn prepare_workload(cache: Cache, workload: Workload) -> anyhow::Result<PreparedWorkload> {
    let target = match workload.payload {
        Payload::Keys(0) => anyhow::bail!("a workload needs at least one key"),
        Payload::Keys(count) => Target::Keys(
            (0..count)
                .map(|i| CacheKey::explicit(format!("stress:{i}")))
                .collect::<Result<_, _>>()?,
        ),
        Payload::Repository(count) => {
            let items = (0..count).map(|id| Item { id, revision: 0 }).collect();
            let repository =
                InMemoryRepository::with_entities(items).with_latency(workload.latency);
            Target::Repository(Cached::new(cache.clone(), Arc::new(repository)))
        }
    };

    let options = LoadOptions {
        ttl: workload.ttl,
        ..Default::default()
    };

    Ok(PreparedWorkload {
        cache,
        target,
        options,
        latency: workload.latency,
        fail_every: workload.fail_every.filter(|n| *n > 0),
        invalidate_every: workload.invalidate_every.filter(|n| *n > 0),
        operations: AtomicUsize::new(0),
        invocations: Default::default(),
        failures: AtomicUsize::new(0),
    })
}

impl PreparedWorkload {
    /// Runs a single operation of this workload.
    pub async fn process(&self) {
        let operation = self.operations.fetch_add(1, Ordering::Relaxed);
        let invalidate = self
            .invalidate_every
            .is_some_and(|n| (operation + 1) % n == 0);

        let result = match &self.target {
            Target::Keys(keys) => {
                let key = &keys[operation % keys.len()];
                let result = self.load_key(key).await;
                if invalidate {
                    self.cache.invalidate(key);
                }
                result
            }
            Target::Repository(cached) => {
                let result = cached.get_all(Query::all()).await.map(|_| ());
                if invalidate {
                    self.touch(cached, operation).await;
                }
                result
            }
        };

        if let Err(error) = result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = &error as &dyn std::error::Error, "Operation failed");
        }
    }

    async fn load_key(&self, key: &CacheKey) -> Result<(), CacheError> {
        let invocations = Arc::clone(&self.invocations);
        let latency = self.latency;
        let fail_every = self.fail_every;

        self.cache
            .get_or_load_with(key, self.options, move || async move {
                let invocation = invocations.fetch_add(1, Ordering::Relaxed) + 1;
                tokio::time::sleep(latency).await;
                match fail_every {
                    Some(n) if invocation % n == 0 => Err(SimulatedFailure),
                    _ => Ok(invocation),
                }
            })
            .await
            .map(|_: Arc<usize>| ())
    }

    /// Writes one entity, which invalidates the cached collection.
    async fn touch(&self, cached: &Cached<Item, InMemoryRepository<Item>>, operation: usize) {
        let Some(mut item) = cached
            .get_by_id(&(operation % cached.repository().len().max(1)))
            .await
            .ok()
            .flatten()
        else {
            return;
        };

        item.revision += 1;
        if let Err(error) = cached.update(item).await {
            tracing::warn!(error = &error as &dyn std::error::Error, "Failed to update item");
        }
    }

    pub fn stats(&self) -> WorkloadStats {
        let invocations = match &self.target {
            Target::Keys(_) => self.invocations.load(Ordering::Relaxed),
            Target::Repository(cached) => cached.repository().query_count(),
        };

        WorkloadStats {
            invocations,
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 64
                latency: 20ms
                fail_every: 10
                keys: 16
              - concurrency: 8
                ttl: 1s
                invalidate_every: 100
                repository: 1000
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();

        let [keys, repository] = &config.workloads[..] else {
            panic!("expected two workloads");
        };
        assert!(matches!(keys.payload, Payload::Keys(16)));
        assert_eq!(keys.latency, Duration::from_millis(20));
        assert_eq!(keys.ttl, None);
        assert_eq!(keys.fail_every, Some(10));

        assert!(matches!(repository.payload, Payload::Repository(1000)));
        assert_eq!(repository.latency, Duration::ZERO);
        assert_eq!(repository.ttl, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_keys_workload() {
        let cache = Cache::new(Default::default());
        let workload = Workload {
            concurrency: 1,
            latency: Duration::ZERO,
            ttl: None,
            fail_every: Some(2),
            invalidate_every: Some(1),
            payload: Payload::Keys(1),
        };
        let workload = prepare_workload(cache, workload).unwrap();

        for _ in 0..4 {
            workload.process().await;
        }

        // every operation invalidates, so every one of them runs the producer
        let stats = workload.stats();
        assert_eq!(stats.invocations, 4);
        assert_eq!(stats.failures, 2);
    }

    #[tokio::test]
    async fn test_repository_workload() {
        let cache = Cache::new(Default::default());
        let workload = Workload {
            concurrency: 1,
            latency: Duration::ZERO,
            ttl: None,
            fail_every: None,
            invalidate_every: None,
            payload: Payload::Repository(10),
        };
        let workload = prepare_workload(cache, workload).unwrap();

        for _ in 0..5 {
            workload.process().await;
        }

        let stats = workload.stats();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.failures, 0);
    }
}
