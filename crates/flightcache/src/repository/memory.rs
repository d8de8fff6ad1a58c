use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{Entity, Query, Repository, RepositoryError};

/// A [`Repository`] keeping its entities in process memory.
///
/// Every executed read is counted, which makes it easy to observe whether a read was served
/// by a cache in front of it. An optional latency simulates a remote database.
pub struct InMemoryRepository<T> {
    entities: RwLock<Vec<T>>,
    latency: Option<Duration>,
    queries: AtomicUsize,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self::with_entities(Vec::new())
    }

    pub fn with_entities(entities: Vec<T>) -> Self {
        Self {
            entities: RwLock::new(entities),
            latency: None,
            queries: AtomicUsize::new(0),
        }
    }

    /// Delays every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The number of reads executed so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn roundtrip(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InMemoryRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("entities", &self.len())
            .field("latency", &self.latency)
            .field("queries", &self.query_count())
            .finish()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    async fn get(&self, query: &Query<T>) -> Result<Vec<T>, RepositoryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.roundtrip().await;

        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(query.apply(entities.iter().cloned()))
    }

    async fn get_by_id(&self, id: &T::Id) -> Result<Option<T>, RepositoryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.roundtrip().await;

        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entities.iter().find(|e| e.id() == *id).cloned())
    }

    async fn insert(&self, entity: T) -> Result<(), RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let id = entity.id();
        if entities.iter().any(|e| e.id() == id) {
            return Err(RepositoryError::Conflict(format!("{id:?}")));
        }
        entities.push(entity);
        Ok(())
    }

    async fn update(&self, entity: T) -> Result<(), RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let id = entity.id();
        match entities.iter_mut().find(|e| e.id() == id) {
            Some(existing) => {
                *existing = entity;
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("{id:?}"))),
        }
    }

    async fn insert_many(&self, new: Vec<T>) -> Result<(), RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let mut ids: HashSet<_> = entities.iter().map(Entity::id).collect();
        if let Some(taken) = new.iter().map(Entity::id).find(|id| !ids.insert(id.clone())) {
            return Err(RepositoryError::Conflict(format!("{taken:?}")));
        }
        entities.extend(new);
        Ok(())
    }

    async fn update_many(&self, updated: Vec<T>) -> Result<(), RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let mut positions = Vec::with_capacity(updated.len());
        for entity in &updated {
            let id = entity.id();
            match entities.iter().position(|e| e.id() == id) {
                Some(position) => positions.push(position),
                None => return Err(RepositoryError::NotFound(format!("{id:?}"))),
            }
        }
        for (position, entity) in positions.into_iter().zip(updated) {
            entities[position] = entity;
        }
        Ok(())
    }

    async fn delete(&self, id: &T::Id) -> Result<(), RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let before = entities.len();
        entities.retain(|e| e.id() != *id);
        if entities.len() == before {
            return Err(RepositoryError::NotFound(format!("{id:?}")));
        }
        Ok(())
    }

    async fn delete_where(&self, query: &Query<T>) -> Result<usize, RepositoryError> {
        self.roundtrip().await;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: HashSet<_> = query
            .apply(entities.iter().cloned())
            .iter()
            .map(Entity::id)
            .collect();
        entities.retain(|e| !doomed.contains(&e.id()));
        Ok(doomed.len())
    }
}
