//! In-memory provider: reference collaborator for tests, demos and the CLI.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::{matches_filter, paginate, Filter, ListOptions, Provider, ScoredEntity, SemanticSearchOptions};
use crate::embeddings::{find_similar, CachedEmbedder, Embedder, EmbeddingCache, FallbackEmbedder, SimilarityOptions};
use crate::entity::Entity;
use crate::error::{EntigraphError, Result};

/// Per-operation call counters.
#[derive(Debug, Default)]
struct Counters {
    get: AtomicUsize,
    list: AtomicUsize,
    create: AtomicUsize,
    update: AtomicUsize,
    delete: AtomicUsize,
    search: AtomicUsize,
    semantic_search: AtomicUsize,
}

/// Snapshot of provider call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub list: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub search: usize,
    pub semantic_search: usize,
}

impl CallCounts {
    /// Calls that wrote to storage.
    pub fn writes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

/// Entities kept per type in insertion order.
pub struct MemoryProvider {
    store: RwLock<HashMap<String, Vec<Entity>>>,
    embedder: Arc<dyn Embedder>,
    counters: Counters,
    latency: Option<Duration>,
    failing_gets: AtomicUsize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Provider using the deterministic mock embedder (256 dimensions).
    pub fn new() -> Self {
        Self::with_embedder(None, 256, 1000)
    }

    /// Provider using `embedder` for semantic search, falling back to the
    /// mock embedder when it is absent or failing.
    pub fn with_embedder(embedder: Option<Arc<dyn Embedder>>, dimensions: usize, cache_capacity: usize) -> Self {
        let fallback: Arc<dyn Embedder> = Arc::new(FallbackEmbedder::new(embedder, dimensions));
        let cached = CachedEmbedder::new(fallback, Arc::new(EmbeddingCache::new(cache_capacity)));
        Self {
            store: RwLock::new(HashMap::new()),
            embedder: Arc::new(cached),
            counters: Counters::default(),
            latency: None,
            failing_gets: AtomicUsize::new(0),
        }
    }

    /// Suspend for `latency` inside every call, simulating I/O.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` `get` calls fail with a provider error.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            get: self.counters.get.load(Ordering::SeqCst),
            list: self.counters.list.load(Ordering::SeqCst),
            create: self.counters.create.load(Ordering::SeqCst),
            update: self.counters.update.load(Ordering::SeqCst),
            delete: self.counters.delete.load(Ordering::SeqCst),
            search: self.counters.search.load(Ordering::SeqCst),
            semantic_search: self.counters.semantic_search.load(Ordering::SeqCst),
        }
    }

    /// Number of stored entities of `entity_type`.
    pub fn count(&self, entity_type: &str) -> usize {
        self.read().get(entity_type).map(Vec::len).unwrap_or(0)
    }

    /// Total number of stored entities.
    pub fn total(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    /// All entities of a type without touching the call counters.
    pub fn snapshot(&self, entity_type: &str) -> Vec<Entity> {
        self.read().get(entity_type).cloned().unwrap_or_default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Entity>>> {
        self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Entity>>> {
        self.store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_io(&self) {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let should_fail = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EntigraphError::Provider(format!(
                "injected failure reading {}/{}",
                entity_type, id
            )));
        }

        Ok(self
            .read()
            .get(entity_type)
            .and_then(|entities| entities.iter().find(|e| e.id == id).cloned()))
    }

    async fn list(&self, entity_type: &str, options: &ListOptions) -> Result<Vec<Entity>> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;
        Ok(paginate(self.snapshot(entity_type), options))
    }

    async fn create(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Entity> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let entity = Entity::new(entity_type, id, fields);
        let mut store = self.write();
        let entities = store.entry(entity_type.to_string()).or_default();
        if entities.iter().any(|e| e.id == id) {
            return Err(EntigraphError::Provider(format!(
                "{}/{} already exists",
                entity_type, id
            )));
        }
        entities.push(entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Entity> {
        self.counters.update.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let mut store = self.write();
        let existing = store
            .get_mut(entity_type)
            .and_then(|entities| entities.iter_mut().find(|e| e.id == id))
            .ok_or_else(|| EntigraphError::NotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            })?;
        for (key, value) in fields {
            existing.fields.insert(key, value);
        }
        Ok(existing.clone())
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let mut store = self.write();
        let Some(entities) = store.get_mut(entity_type) else {
            return Ok(false);
        };
        let before = entities.len();
        entities.retain(|e| e.id != id);
        Ok(entities.len() != before)
    }

    async fn search(
        &self,
        entity_type: &str,
        filter: &Filter,
        options: &ListOptions,
    ) -> Result<Vec<Entity>> {
        self.counters.search.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let matches: Vec<Entity> = self
            .snapshot(entity_type)
            .into_iter()
            .filter(|e| matches_filter(e, filter))
            .collect();
        Ok(paginate(matches, options))
    }

    async fn semantic_search(
        &self,
        entity_type: &str,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<ScoredEntity>> {
        self.counters.semantic_search.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await;

        let candidates = self.snapshot(entity_type);
        if candidates.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed(query).await?;
        let texts: Vec<String> = candidates.iter().map(Entity::searchable_text).collect();
        let embeddings = self.embedder.embed_texts(&texts).await?;

        let hits = find_similar(
            &query_vec,
            &embeddings,
            &candidates,
            SimilarityOptions {
                top_k: options.limit,
                min_score: options.min_score,
            },
        );
        log::debug!(
            "Semantic search {} '{}': {} of {} candidates >= {}",
            entity_type,
            query,
            hits.len(),
            candidates.len(),
            options.min_score
        );

        Ok(hits
            .into_iter()
            .map(|hit| ScoredEntity {
                entity: hit.item,
                score: hit.score,
            })
            .collect())
    }
}
