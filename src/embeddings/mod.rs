//! Embedding collaborator: trait, similarity helpers and reference embedders.
//!
//! Real embedding backends live outside this crate. When none is supplied,
//! semantic search degrades to the deterministic [`MockEmbedder`].

mod cache;
mod mock;

pub use cache::{CachedEmbedder, EmbeddingCache};
pub use mock::MockEmbedder;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{EntigraphError, Result};

/// Produces one vector per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_texts(&[text.to_string()]).await?;
        if embeddings.is_empty() {
            return Err(EntigraphError::Embedding("empty embedding response".to_string()));
        }
        Ok(embeddings.remove(0))
    }
}

/// Cosine similarity; 0.0 when either vector has zero magnitude or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimilarityOptions {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for SimilarityOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub item: T,
    pub score: f32,
}

/// Score `items` against `query`, keep those with score >= `min_score`,
/// highest first. Equal scores keep input order.
pub fn find_similar<T: Clone>(
    query: &[f32],
    embeddings: &[Vec<f32>],
    items: &[T],
    options: SimilarityOptions,
) -> Vec<Scored<T>> {
    let mut scored: Vec<Scored<T>> = embeddings
        .iter()
        .zip(items.iter())
        .filter_map(|(embedding, item)| {
            let score = cosine_similarity(query, embedding);
            (score >= options.min_score).then(|| Scored {
                item: item.clone(),
                score,
            })
        })
        .collect();
    // sort_by is stable, which gives the tie-break
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(options.top_k);
    scored
}

/// Uses the primary embedder when present and healthy, the mock otherwise.
pub struct FallbackEmbedder {
    primary: Option<Arc<dyn Embedder>>,
    mock: MockEmbedder,
}

impl FallbackEmbedder {
    pub fn new(primary: Option<Arc<dyn Embedder>>, dimensions: usize) -> Self {
        Self {
            primary,
            mock: MockEmbedder::new(dimensions),
        }
    }
}

#[async_trait]
impl Embedder for FallbackEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(primary) = &self.primary {
            match primary.embed_texts(texts).await {
                Ok(embeddings) if embeddings.len() == texts.len() => return Ok(embeddings),
                Ok(embeddings) => log::warn!(
                    "Embedder returned {} vectors for {} texts; using mock embeddings",
                    embeddings.len(),
                    texts.len()
                ),
                Err(e) => log::warn!("Embedder failed ({}); using mock embeddings", e),
            }
        }
        self.mock.embed_texts(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Embedder for Broken {
        async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(EntigraphError::Embedding("offline".to_string()))
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_find_similar_orders_and_filters() {
        let query = vec![1.0, 0.0];
        let embeddings = vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![1.0, 0.0]];
        let items = vec!["orthogonal", "diagonal", "same"];

        let results = find_similar(&query, &embeddings, &items, SimilarityOptions { top_k: 10, min_score: 0.5 });
        let names: Vec<_> = results.iter().map(|r| r.item).collect();
        assert_eq!(names, vec!["same", "diagonal"]);
    }

    #[test]
    fn test_find_similar_tie_keeps_input_order() {
        let query = vec![1.0, 0.0];
        let embeddings = vec![vec![2.0, 0.0], vec![1.0, 0.0], vec![3.0, 0.0]];
        let items = vec!["a", "b", "c"];
        let results = find_similar(&query, &embeddings, &items, SimilarityOptions { top_k: 2, min_score: 0.0 });
        let names: Vec<_> = results.iter().map(|r| r.item).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_stricter_threshold_never_matches_more() {
        let query = vec![1.0, 0.2, 0.0];
        let embeddings = vec![vec![1.0, 0.0, 0.0], vec![0.5, 0.5, 0.5], vec![0.0, 0.0, 1.0]];
        let items = vec![1, 2, 3];
        let loose = find_similar(&query, &embeddings, &items, SimilarityOptions { top_k: 10, min_score: 0.5 });
        let strict = find_similar(&query, &embeddings, &items, SimilarityOptions { top_k: 10, min_score: 0.9 });
        assert!(strict.len() <= loose.len());
    }

    #[tokio::test]
    async fn test_fallback_uses_mock_when_primary_fails() {
        let fallback = FallbackEmbedder::new(Some(Arc::new(Broken)), 64);
        let embeddings = fallback.embed_texts(&["hello world".to_string()]).await.unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].len(), 64);
    }
}
