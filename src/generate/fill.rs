use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::{
    with_retry, AncestorContext, ContentGenerator, ContextEntity, GenerationRequest, RelationRequest,
    RetryPolicy,
};
use crate::entity::Entity;
use crate::error::EntigraphError;
use crate::schema::{EntitySchema, ParsedField, ParsedSchema, PrimitiveType, AUTO_FIELDS};

/// Streaming side channel: `(field, chunk)`.
pub type ChunkCallback<'a> = dyn Fn(&str, &str) + Send + Sync + 'a;

/// A primitive field the generator could not produce.
#[derive(Debug)]
pub struct FieldFailure {
    pub field: String,
    pub error: EntigraphError,
}

/// Fills unset primitive fields of one entity, one field at a time, so
/// later prompts see earlier values.
pub struct FieldFiller<'a> {
    generator: &'a dyn ContentGenerator,
    retry: RetryPolicy,
    on_chunk: Option<&'a ChunkCallback<'a>>,
    context: &'a [ContextEntity],
}

impl<'a> FieldFiller<'a> {
    pub fn new(generator: &'a dyn ContentGenerator, retry: RetryPolicy) -> Self {
        Self {
            generator,
            retry,
            on_chunk: None,
            context: &[],
        }
    }

    /// Route generated text through `on_chunk` as it is produced.
    pub fn streaming(mut self, on_chunk: Option<&'a ChunkCallback<'a>>) -> Self {
        self.on_chunk = on_chunk;
        self
    }

    /// Entities of the type's `$context` types, passed with every request.
    pub fn with_context(mut self, context: &'a [ContextEntity]) -> Self {
        self.context = context;
        self
    }

    /// Generate every declared primitive missing from `fields`. Failures are
    /// returned, not raised; the field stays unset.
    pub async fn fill(
        &self,
        schema: &EntitySchema,
        fields: &mut Map<String, Value>,
        ancestors: &[AncestorContext],
    ) -> Vec<FieldFailure> {
        let mut failures = Vec::new();

        for (field, primitive) in schema.primitives() {
            if AUTO_FIELDS.contains(&field.name.as_str()) {
                continue;
            }
            if fields.get(&field.name).map(|v| !v.is_null()).unwrap_or(false) {
                continue;
            }

            let request = GenerationRequest {
                entity_type: schema.name.clone(),
                field: field.name.clone(),
                instructions: schema.instructions.clone(),
                prompt: field.prompt.clone(),
                primitive: primitive.clone(),
                is_array: field.is_array,
                current: fields.clone(),
                ancestors: ancestors.to_vec(),
                context: self.context.to_vec(),
            };
            let label = format!("{}.{}", schema.name, field.name);

            let result = match self.on_chunk {
                Some(on_chunk) => {
                    let name = field.name.as_str();
                    let forward = move |chunk: &str| on_chunk(name, chunk);
                    with_retry(self.retry, &label, || {
                        self.generator.generate_field_stream(&request, &forward)
                    })
                    .await
                }
                None => with_retry(self.retry, &label, || self.generator.generate_field(&request)).await,
            };

            match result {
                Ok(value) => {
                    fields.insert(field.name.clone(), value);
                }
                Err(error) => {
                    log::warn!("Leaving {} unfilled: {}", label, error);
                    failures.push(FieldFailure {
                        field: field.name.clone(),
                        error,
                    });
                }
            }
        }

        failures
    }
}

/// Free-text fields of a type in declaration order; seeds and hints land in
/// the first of these.
pub fn text_fields(schema: &EntitySchema) -> Vec<String> {
    schema
        .primitives()
        .filter(|(field, primitive)| {
            matches!(primitive, PrimitiveType::String | PrimitiveType::Markdown)
                && !AUTO_FIELDS.contains(&field.name.as_str())
        })
        .map(|(field, _)| field.name.clone())
        .collect()
}

/// Build the generator request for relationship `field` of `source`.
#[allow(clippy::too_many_arguments)]
pub fn relation_request(
    schema: &ParsedSchema,
    source: &EntitySchema,
    field: &ParsedField,
    target_type: &str,
    hint: Option<&str>,
    count: usize,
    current: &Map<String, Value>,
    ancestors: &[AncestorContext],
) -> RelationRequest {
    let target = schema.entity(target_type);
    RelationRequest {
        source_type: source.name.clone(),
        field: field.name.clone(),
        target_type: target_type.to_string(),
        target_instructions: target.and_then(|t| t.instructions.clone()),
        prompt: field.prompt.clone(),
        hint: hint.map(str::to_string),
        count,
        target_fields: target.map(text_fields).unwrap_or_default(),
        current: current.clone(),
        ancestors: ancestors.to_vec(),
        context: Vec::new(),
    }
}

/// Prompt-sized view of an entity offered as `$context`.
pub fn context_entity(entity: &Entity) -> ContextEntity {
    ContextEntity {
        entity_type: entity.entity_type.clone(),
        id: entity.id.clone(),
        summary: summarize(&entity.fields),
    }
}

/// Stamp `createdAt`/`updatedAt` where the type has them enabled.
pub fn stamp_timestamps(schema: &EntitySchema, fields: &mut Map<String, Value>, created: bool) {
    let now = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    if created && schema.auto_field_enabled("createdAt") {
        fields.insert("createdAt".to_string(), now.clone());
    }
    if schema.auto_field_enabled("updatedAt") {
        fields.insert("updatedAt".to_string(), now);
    }
}

/// Short text describing an entity for prompts.
pub fn summarize(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .filter(|(key, _)| !AUTO_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, value)| value.as_str().map(|s| format!("{}: {}", key, s)))
        .take(4)
        .collect::<Vec<_>>()
        .join("; ")
}
