//! Storage provider contract.
//!
//! Durable storage is external; this module defines the async interface the
//! graph layer talks to and ships an in-memory reference implementation.

mod memory;

pub use memory::{CallCounts, MemoryProvider};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::entity::Entity;
use crate::error::Result;

/// Equality filter. A filter value matches a field equal to it, or an array
/// field containing it.
pub type Filter = Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SemanticSearchOptions {
    pub limit: usize,
    pub min_score: f32,
}

impl Default for SemanticSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
        }
    }
}

/// Semantic search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredEntity {
    #[serde(flatten)]
    pub entity: Entity,
    #[serde(rename = "$score")]
    pub score: f32,
}

/// Storage and search primitives. Implementations own their concurrency
/// control; the graph layer may call them from many tasks at once.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Point lookup. A missing entity is `Ok(None)`, not an error.
    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>>;

    async fn list(&self, entity_type: &str, options: &ListOptions) -> Result<Vec<Entity>>;

    async fn create(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Entity>;

    /// Merge `fields` into an existing entity.
    async fn update(
        &self,
        entity_type: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Entity>;

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool>;

    async fn search(
        &self,
        entity_type: &str,
        filter: &Filter,
        options: &ListOptions,
    ) -> Result<Vec<Entity>>;

    /// Hits with score >= `min_score`, best first; equal scores keep storage order.
    async fn semantic_search(
        &self,
        entity_type: &str,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<ScoredEntity>>;
}

/// Filter semantics shared by providers that evaluate filters in process.
pub fn matches_filter(entity: &Entity, filter: &Filter) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = if key == "$id" {
            Some(Value::String(entity.id.clone()))
        } else {
            entity.get(key).cloned()
        };
        match actual {
            Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
            Some(value) => &value == expected,
            None => expected.is_null(),
        }
    })
}

/// Apply offset/limit to an already ordered result set.
pub fn paginate(entities: Vec<Entity>, options: &ListOptions) -> Vec<Entity> {
    let iter = entities.into_iter().skip(options.offset);
    match options.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
