//! Content generator collaborator.
//!
//! The model-backed generator lives outside this crate; cascade and draft
//! generation talk to it through [`ContentGenerator`]. [`TemplateGenerator`]
//! is a deterministic stand-in used by tests and the CLI.

mod fill;
mod retry;
mod template;

pub use fill::{context_entity, relation_request, stamp_timestamps, summarize, text_fields, ChunkCallback, FieldFailure, FieldFiller};
pub use retry::{with_retry, with_timeout, RetryPolicy};
pub use template::TemplateGenerator;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::schema::PrimitiveType;

/// Summary of an entity further up the cascade, offered as prompt material.
#[derive(Debug, Clone, Serialize)]
pub struct AncestorContext {
    pub entity_type: String,
    pub id: String,
    /// Field on the ancestor that led here.
    pub via_field: String,
    pub summary: String,
}

/// Existing entity of a `$context` type, offered as background material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntity {
    pub entity_type: String,
    pub id: String,
    pub summary: String,
}

/// Request for one primitive field value.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub entity_type: String,
    pub field: String,
    /// `$instructions` of the entity type
    pub instructions: Option<String>,
    /// Free-text prompt from the field declaration
    pub prompt: Option<String>,
    pub primitive: PrimitiveType,
    pub is_array: bool,
    /// Sibling values known so far (seed plus already generated fields)
    pub current: Map<String, Value>,
    pub ancestors: Vec<AncestorContext>,
    /// Entities of the types listed in `$context`
    pub context: Vec<ContextEntity>,
}

/// Request concerning a relationship field: a placeholder description, or
/// seeds for child entities.
#[derive(Debug, Clone, Serialize)]
pub struct RelationRequest {
    pub source_type: String,
    pub field: String,
    pub target_type: String,
    /// `$instructions` of the target type
    pub target_instructions: Option<String>,
    pub prompt: Option<String>,
    /// Natural-language description of the wanted target, when known
    pub hint: Option<String>,
    /// Number of seeds wanted (1 for singular fields)
    pub count: usize,
    /// Text fields of the target type, in declaration order
    pub target_fields: Vec<String>,
    pub current: Map<String, Value>,
    pub ancestors: Vec<AncestorContext>,
    /// Entities of the source type's `$context` types
    pub context: Vec<ContextEntity>,
}

impl RelationRequest {
    pub fn with_context(mut self, context: &[ContextEntity]) -> Self {
        self.context = context.to_vec();
        self
    }
}

/// Produces content for entity fields.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Value for one primitive field.
    async fn generate_field(&self, request: &GenerationRequest) -> Result<Value>;

    /// Seeds (partial field maps) for up to `request.count` child entities.
    async fn generate_seeds(&self, request: &RelationRequest) -> Result<Vec<Map<String, Value>>>;

    /// Human-readable placeholder describing the wanted target.
    async fn describe_relation(&self, request: &RelationRequest) -> Result<String>;

    /// Streaming variant of `generate_field`. `on_chunk` receives partial
    /// text zero or more times before the value is returned.
    async fn generate_field_stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<Value> {
        let value = self.generate_field(request).await?;
        if let Some(text) = value.as_str() {
            on_chunk(text);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Implements only the required methods.
    struct Fixed;

    #[async_trait]
    impl ContentGenerator for Fixed {
        async fn generate_field(&self, _request: &GenerationRequest) -> Result<Value> {
            Ok(Value::String("fixed text".to_string()))
        }

        async fn generate_seeds(&self, _request: &RelationRequest) -> Result<Vec<Map<String, Value>>> {
            Ok(Vec::new())
        }

        async fn describe_relation(&self, _request: &RelationRequest) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_default_stream_sends_whole_value_once() {
        let request = GenerationRequest {
            entity_type: "Post".to_string(),
            field: "title".to_string(),
            instructions: None,
            prompt: None,
            primitive: PrimitiveType::String,
            is_array: false,
            current: Map::new(),
            ancestors: Vec::new(),
            context: Vec::new(),
        };
        let chunks = Mutex::new(Vec::new());
        let on_chunk = |chunk: &str| chunks.lock().unwrap().push(chunk.to_string());

        let value = Fixed.generate_field_stream(&request, &on_chunk).await.unwrap();

        assert_eq!(value, Value::String("fixed text".to_string()));
        assert_eq!(chunks.into_inner().unwrap(), vec!["fixed text".to_string()]);
    }
}
