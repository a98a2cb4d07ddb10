use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::Embedder;
use crate::error::Result;

/// Thread-safe LRU cache of text -> embedding.
///
/// Semantic search re-embeds the same entity texts and hints over and over;
/// this keeps the most recent ones with bounded memory.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Arc<[f32]>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` embeddings (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, text: &str) -> Option<Arc<[f32]>> {
        let found = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(text)
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn put(&self, text: String, embedding: Arc<[f32]>) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(text, embedding);
    }

    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation
    pub fn hit_stats(&self) -> (usize, usize) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// Embedder wrapper that only forwards cache misses to the inner embedder.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<String> = Vec::new();
        let mut missing_slots: Vec<usize> = Vec::new();

        for (slot, text) in texts.iter().enumerate() {
            match self.cache.get(text) {
                Some(hit) => out.push(Some(hit.to_vec())),
                None => {
                    out.push(None);
                    missing.push(text.clone());
                    missing_slots.push(slot);
                }
            }
        }

        if !missing.is_empty() {
            log::debug!("Embedding cache: {} hits, {} misses", texts.len() - missing.len(), missing.len());
            let fresh = self.inner.embed_texts(&missing).await?;
            for ((slot, text), embedding) in missing_slots.into_iter().zip(missing).zip(fresh) {
                self.cache.put(text, Arc::from(embedding.as_slice()));
                out[slot] = Some(embedding);
            }
        }

        Ok(out.into_iter().map(Option::unwrap_or_default).collect())
    }
}
