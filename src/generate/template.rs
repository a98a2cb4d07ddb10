use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ContentGenerator, ContextEntity, GenerationRequest, RelationRequest};
use crate::error::{EntigraphError, Result};
use crate::schema::PrimitiveType;

/// Deterministic generator built from field names, prompts and hints.
///
/// Identical requests always yield identical content, so a relationship
/// hint generated twice matches the entity created for it the first time.
#[derive(Debug, Default)]
pub struct TemplateGenerator {
    failing_fields: HashSet<String>,
    failing_relations: HashSet<String>,
    calls: AtomicUsize,
    context_seen: Mutex<Vec<String>>,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request for a field with this name fails.
    pub fn failing_field(mut self, field: impl Into<String>) -> Self {
        self.failing_fields.insert(field.into());
        self
    }

    /// Every seed/description request for this relationship field fails.
    pub fn failing_relation(mut self, field: impl Into<String>) -> Self {
        self.failing_relations.insert(field.into());
        self
    }

    /// Total generator calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `Type/id` of every context entity offered so far, first seen first.
    pub fn context_seen(&self) -> Vec<String> {
        self.context_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn note_context(&self, context: &[ContextEntity]) {
        let mut seen = self.context_seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entity in context {
            let key = format!("{}/{}", entity.entity_type, entity.id);
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
    }

    fn text_for(&self, request: &GenerationRequest) -> String {
        match &request.prompt {
            Some(prompt) => format!("{} ({})", prompt.trim_end_matches('?'), request.entity_type),
            None => format!("{} {}", request.entity_type, request.field),
        }
    }

    fn check_relation(&self, request: &RelationRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.note_context(&request.context);
        if self.failing_relations.contains(&request.field) {
            return Err(EntigraphError::Generation(format!(
                "template generator refuses {}.{}",
                request.source_type, request.field
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate_field(&self, request: &GenerationRequest) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.note_context(&request.context);
        if self.failing_fields.contains(&request.field) {
            return Err(EntigraphError::Generation(format!(
                "template generator refuses {}.{}",
                request.entity_type, request.field
            )));
        }

        let value = match &request.primitive {
            PrimitiveType::String | PrimitiveType::Markdown => json!(self.text_for(request)),
            PrimitiveType::Number => json!(0.0),
            PrimitiveType::Integer => json!(0),
            PrimitiveType::Boolean => json!(false),
            PrimitiveType::Date => json!(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            PrimitiveType::DateTime => json!(chrono::Utc::now().to_rfc3339()),
            PrimitiveType::Url => json!(format!(
                "https://example.com/{}/{}",
                request.entity_type.to_lowercase(),
                request.field
            )),
            PrimitiveType::Email => json!(format!(
                "{}@{}.example.com",
                request.field,
                request.entity_type.to_lowercase()
            )),
            PrimitiveType::Json => json!({}),
            PrimitiveType::Enum(members) => json!(members.first().cloned().unwrap_or_default()),
            PrimitiveType::Marker(marker) => json!(marker),
        };

        if request.is_array {
            return Ok(Value::Array(vec![value]));
        }
        Ok(value)
    }

    async fn generate_seeds(&self, request: &RelationRequest) -> Result<Vec<Map<String, Value>>> {
        self.check_relation(request)?;

        let base = match &request.hint {
            Some(hint) => hint.clone(),
            None => format!("{} of {}", request.target_type, request.source_type),
        };

        let seeds = (0..request.count.max(1))
            .map(|i| {
                let mut seed = Map::new();
                if let Some(first) = request.target_fields.first() {
                    let text = if request.count > 1 {
                        format!("{} #{}", base, i + 1)
                    } else {
                        base.clone()
                    };
                    seed.insert(first.clone(), Value::String(text));
                }
                seed
            })
            .collect();
        Ok(seeds)
    }

    async fn describe_relation(&self, request: &RelationRequest) -> Result<String> {
        self.check_relation(request)?;
        Ok(match &request.prompt {
            Some(prompt) => prompt.clone(),
            None => format!("{} of {}", request.target_type, request.source_type),
        })
    }

    async fn generate_field_stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<Value> {
        let value = self.generate_field(request).await?;
        if let Some(text) = value.as_str() {
            for word in text.split_inclusive(' ') {
                on_chunk(word);
            }
        }
        Ok(value)
    }
}
