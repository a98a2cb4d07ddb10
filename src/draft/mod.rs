//! Two-phase generation: draft, inspect or edit, then resolve.
//!
//! `draft` produces an unpersisted entity whose relationship fields hold
//! natural-language placeholders. `resolve` turns each placeholder into a
//! committed relationship and writes the entity exactly once. The only
//! transition is `Draft -> Resolved`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::entity::{value_strings, Draft, Entity, FieldRef, Phase};
use crate::error::{EntigraphError, Result};
use crate::generate::{relation_request, with_retry, with_timeout, ChunkCallback, FieldFiller};
use crate::resolve::Resolver;
use crate::schema::{RelationOperator, DEFAULT_FUZZY_THRESHOLD};

pub type ResolvedCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct DraftOptions {
    pub stream: bool,
    /// Receives `(field, chunk)` while primitive fields stream in.
    pub on_chunk: Option<Arc<ChunkCallback<'static>>>,
    pub timeout: Option<Duration>,
}

impl DraftOptions {
    pub fn streaming(on_chunk: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        Self {
            stream: true,
            on_chunk: Some(Arc::new(on_chunk)),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Default)]
pub struct ResolveOptions {
    /// Called with `(field, id)` for every committed relationship id.
    pub on_resolved: Option<ResolvedCallback>,
    pub timeout: Option<Duration>,
}

impl ResolveOptions {
    pub fn on_resolved(callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        Self {
            on_resolved: Some(Arc::new(callback)),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct DraftResolver {
    resolver: Resolver,
}

impl DraftResolver {
    pub fn new(resolver: Resolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Generate a draft. Nothing is written to the provider.
    pub async fn draft(
        &self,
        entity_type: &str,
        seed: Map<String, Value>,
        options: DraftOptions,
    ) -> Result<Draft> {
        with_timeout(options.timeout, self.build_draft(entity_type, seed, &options)).await
    }

    async fn build_draft(&self, entity_type: &str, seed: Map<String, Value>, options: &DraftOptions) -> Result<Draft> {
        let schema = self.resolver.schema();
        let source = schema.require_entity(entity_type)?;
        let context = self.resolver.load_context(source).await?;

        let mut fields = seed;
        let on_chunk = match (&options.on_chunk, options.stream) {
            (Some(on_chunk), true) => Some(on_chunk.as_ref() as &ChunkCallback<'_>),
            _ => None,
        };
        FieldFiller::new(self.resolver.generator().as_ref(), self.resolver.retry())
            .streaming(on_chunk)
            .with_context(&context)
            .fill(source, &mut fields, &[])
            .await;

        let mut refs = BTreeMap::new();
        for (field, rel) in source.relationships() {
            if rel.operator == RelationOperator::BackwardExact {
                fields.remove(&field.name);
                continue;
            }

            let seeded = fields.get(&field.name).map(value_strings).unwrap_or_default();
            let description = if seeded.is_empty() {
                let request = relation_request(schema, source, field, rel.target_type(), None, 1, &fields, &[])
                    .with_context(&context);
                let label = format!("{}.{} placeholder", source.name, field.name);
                match with_retry(self.resolver.retry(), &label, || {
                    self.resolver.generator().describe_relation(&request)
                })
                .await
                {
                    Ok(text) => {
                        let placeholder = if field.is_array {
                            Value::Array(vec![Value::String(text.clone())])
                        } else {
                            Value::String(text.clone())
                        };
                        fields.insert(field.name.clone(), placeholder);
                        text
                    }
                    Err(e) if e.is_generation() => {
                        log::warn!("No placeholder for {}: {}", label, e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                seeded.join("; ")
            };

            refs.insert(
                field.name.clone(),
                FieldRef {
                    target_type: rel.target_type().to_string(),
                    resolved: false,
                    description,
                    resolved_ids: Vec::new(),
                },
            );
        }

        let draft = Draft {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: source.name.clone(),
            phase: Phase::Draft,
            refs,
            fields,
        };
        log::debug!("Drafted {}/{} with {} placeholders", draft.entity_type, draft.id, draft.refs.len());
        Ok(draft)
    }

    /// Commit a draft: settle every placeholder, persist once, flip the phase.
    ///
    /// `->` keeps a value that is an existing id and generates a new target
    /// from free text. `~>` reuses or creates. `<~` grounds against reference
    /// data and keeps the hint in the field. A draft that fails halfway stays
    /// a draft; targets created before the failure remain stored. The same
    /// holds when `options.timeout` expires.
    pub async fn resolve(&self, draft: &mut Draft, options: ResolveOptions) -> Result<Entity> {
        with_timeout(options.timeout, self.commit(draft, &options)).await
    }

    async fn commit(&self, draft: &mut Draft, options: &ResolveOptions) -> Result<Entity> {
        if !draft.is_draft() {
            return Err(EntigraphError::ResolveState(format!(
                "{}/{} is already resolved",
                draft.entity_type, draft.id
            )));
        }

        let schema = self.resolver.schema();
        let source = schema.require_entity(&draft.entity_type)?;
        let context = self.resolver.load_context(source).await?;
        let mut fields = draft.fields.clone();
        let mut committed: Vec<(String, Vec<String>)> = Vec::new();

        for (field, rel) in source.relationships() {
            if rel.operator == RelationOperator::BackwardExact {
                fields.remove(&field.name);
                continue;
            }
            let values = fields.get(&field.name).map(value_strings).unwrap_or_default();
            if values.is_empty() {
                continue;
            }
            let threshold = rel.threshold_or(DEFAULT_FUZZY_THRESHOLD);

            let mut ids = Vec::with_capacity(values.len());
            for value in &values {
                let request =
                    relation_request(schema, source, field, rel.target_type(), Some(value.as_str()), 1, &fields, &[])
                        .with_context(&context);
                let id = match rel.operator {
                    RelationOperator::ForwardExact => match self.resolver.load_any(&rel.target_types, value).await? {
                        Some(existing) => Some(existing.id),
                        None => Some(self.resolver.create_from_hint(&request).await?.id),
                    },
                    RelationOperator::ForwardFuzzy => Some(
                        self.resolver
                            .match_or_create(&rel.target_types, &request, threshold)
                            .await?
                            .into_entity()
                            .id,
                    ),
                    RelationOperator::BackwardFuzzy => self
                        .resolver
                        .ground(value, &rel.target_types, threshold)
                        .await?
                        .map(|hit| hit.entity.id),
                    RelationOperator::BackwardExact => None,
                };
                ids.extend(id);
            }

            if rel.operator.is_forward() {
                let stored = if field.is_array {
                    Value::Array(ids.iter().cloned().map(Value::String).collect())
                } else {
                    ids.first().cloned().map(Value::String).unwrap_or(Value::Null)
                };
                fields.insert(field.name.clone(), stored);
            }
            committed.push((field.name.clone(), ids));
        }

        let entity = self
            .resolver
            .persist(&draft.entity_type, Some(draft.id.as_str()), fields)
            .await?;

        draft.phase = Phase::Resolved;
        draft.fields = entity.fields.clone();
        for (field, ids) in &committed {
            if let Some(field_ref) = draft.refs.get_mut(field) {
                field_ref.resolved = true;
                field_ref.resolved_ids = ids.clone();
            }
            if let Some(callback) = &options.on_resolved {
                for id in ids {
                    callback(field, id);
                }
            }
        }
        log::info!(
            "Resolved draft {}/{}: {} relationship fields",
            draft.entity_type,
            draft.id,
            committed.len()
        );
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{RetryPolicy, TemplateGenerator};
    use crate::provider::{MemoryProvider, Provider};
    use crate::schema::{parse_schema, ParsedSchema};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn blog() -> Arc<ParsedSchema> {
        Arc::new(
            parse_schema(&json!({
                "Author": { "name": "string", "posts": "<-Post.author" },
                "Post": {
                    "title": "string",
                    "body": "Write a friendly intro paragraph",
                    "author": "->Author",
                    "tags": ["->Tag"],
                    "category": "~>Category(0.6)",
                },
                "Tag": { "name": "string" },
                "Category": { "name": "string" },
                "Person": { "name": "string", "occupation": "<~Occupation(0.7)" },
                "Occupation": { "title": "string" },
            }))
            .unwrap(),
        )
    }

    fn drafts(provider: &Arc<MemoryProvider>) -> DraftResolver {
        let resolver = Resolver::new(blog(), provider.clone(), Arc::new(TemplateGenerator::new()))
            .with_retry(RetryPolicy::none());
        DraftResolver::new(resolver)
    }

    fn seed(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_draft_never_persists() {
        let provider = Arc::new(MemoryProvider::new());
        let draft = drafts(&provider)
            .draft("Post", seed(json!({ "title": "Hi" })), DraftOptions::default())
            .await
            .unwrap();

        assert!(draft.is_draft());
        assert_eq!(provider.calls().writes(), 0);
        assert_eq!(provider.total(), 0);

        assert_eq!(draft.placeholder("author"), Some("Author of Post"));
        assert_eq!(draft.get("tags"), Some(&json!(["Tag of Post"])));
        let author_ref = &draft.refs["author"];
        assert_eq!(author_ref.target_type, "Author");
        assert!(!author_ref.resolved);
        assert_eq!(draft.refs.len(), 3);
    }

    #[tokio::test]
    async fn test_backward_exact_fields_are_omitted() {
        let provider = Arc::new(MemoryProvider::new());
        let draft = drafts(&provider)
            .draft("Author", seed(json!({ "posts": ["p1"] })), DraftOptions::default())
            .await
            .unwrap();
        assert!(draft.get("posts").is_none());
        assert!(draft.refs.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_persists_exactly_once() {
        let provider = Arc::new(MemoryProvider::new());
        let drafts = drafts(&provider);
        let mut draft = drafts
            .draft("Post", seed(json!({ "title": "Hi" })), DraftOptions::default())
            .await
            .unwrap();

        let resolved = Arc::new(Mutex::new(Vec::new()));
        let seen = resolved.clone();
        let options = ResolveOptions::on_resolved(move |field: &str, id: &str| {
            seen.lock().unwrap().push((field.to_string(), id.to_string()));
        });

        let entity = drafts.resolve(&mut draft, options).await.unwrap();
        assert_eq!(entity.id, draft.id);
        assert_eq!(provider.count("Post"), 1);
        assert_eq!(draft.phase, Phase::Resolved);
        assert!(draft.refs.values().all(|r| r.resolved));
        assert_eq!(draft.to_entity().unwrap(), entity);

        let stored = provider.get("Post", &entity.id).await.unwrap().unwrap();
        assert_eq!(stored.ids("tags").len(), 1);
        let author_id = stored.get_str("author").unwrap();
        assert!(provider.get("Author", author_id).await.unwrap().is_some());

        let fields: Vec<String> = resolved.lock().unwrap().iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(fields, vec!["author", "tags", "category"]);

        let creates = provider.calls().create;
        let err = drafts.resolve(&mut draft, ResolveOptions::default()).await.unwrap_err();
        assert!(matches!(err, EntigraphError::ResolveState(_)));
        assert_eq!(provider.calls().create, creates);
    }

    #[tokio::test]
    async fn test_edited_placeholder_with_id_is_kept() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Author", "a1", seed(json!({ "name": "Jane" }))).await.unwrap();
        let drafts = drafts(&provider);

        let mut draft = drafts.draft("Post", Map::new(), DraftOptions::default()).await.unwrap();
        draft.set("author", json!("a1"));
        let entity = drafts.resolve(&mut draft, ResolveOptions::default()).await.unwrap();

        assert_eq!(entity.get_str("author"), Some("a1"));
        assert_eq!(provider.count("Author"), 1);
        assert_eq!(draft.refs["author"].resolved_ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn test_fuzzy_placeholder_reuses_match() {
        let provider = Arc::new(MemoryProvider::new());
        provider
            .create("Category", "c1", seed(json!({ "name": "Systems Programming" })))
            .await
            .unwrap();
        let drafts = drafts(&provider);

        let mut draft = drafts.draft("Post", Map::new(), DraftOptions::default()).await.unwrap();
        draft.set("category", json!("systems programming"));
        let entity = drafts.resolve(&mut draft, ResolveOptions::default()).await.unwrap();

        assert_eq!(entity.get_str("category"), Some("c1"));
        assert_eq!(provider.count("Category"), 1);
    }

    #[tokio::test]
    async fn test_grounding_placeholder_keeps_hint() {
        let provider = Arc::new(MemoryProvider::new());
        provider
            .create("Occupation", "o1", seed(json!({ "title": "Software Engineer" })))
            .await
            .unwrap();
        let drafts = drafts(&provider);

        let mut draft = drafts
            .draft("Person", seed(json!({ "occupation": "software engineer" })), DraftOptions::default())
            .await
            .unwrap();
        let entity = drafts.resolve(&mut draft, ResolveOptions::default()).await.unwrap();

        assert_eq!(entity.get_str("occupation"), Some("software engineer"));
        assert_eq!(draft.refs["occupation"].resolved_ids, vec!["o1"]);
        assert_eq!(provider.count("Occupation"), 1);
    }

    #[tokio::test]
    async fn test_streamed_chunks_match_fields() {
        let provider = Arc::new(MemoryProvider::new());
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let seen = chunks.clone();
        let options = DraftOptions::streaming(move |field: &str, chunk: &str| {
            seen.lock().unwrap().push((field.to_string(), chunk.to_string()));
        });

        let draft = drafts(&provider).draft("Post", Map::new(), options).await.unwrap();

        let chunks = chunks.lock().unwrap();
        assert!(chunks.len() > 2);
        let body: String = chunks
            .iter()
            .filter(|(field, _)| field == "body")
            .map(|(_, chunk)| chunk.as_str())
            .collect();
        assert_eq!(draft.get("body"), Some(&json!(body)));
        assert_eq!(provider.total(), 0);
    }

    #[tokio::test]
    async fn test_draft_and_resolve_see_context_entities() {
        let schema = parse_schema(&json!({
            "Post": { "$context": "Style", "title": "string", "category": "~>Category" },
            "Category": { "name": "string" },
            "Style": { "tone": "string" },
        }))
        .unwrap();
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Style", "s1", seed(json!({ "tone": "playful" }))).await.unwrap();
        let generator = Arc::new(TemplateGenerator::new());
        let drafts = DraftResolver::new(
            Resolver::new(Arc::new(schema), provider.clone(), generator.clone()).with_retry(RetryPolicy::none()),
        );

        let mut draft = drafts.draft("Post", Map::new(), DraftOptions::default()).await.unwrap();
        assert_eq!(generator.context_seen(), vec!["Style/s1"]);
        assert_eq!(provider.calls().list, 1);

        drafts.resolve(&mut draft, ResolveOptions::default()).await.unwrap();
        assert_eq!(provider.calls().list, 2);
    }

    #[tokio::test]
    async fn test_draft_timeout() {
        let schema = parse_schema(&json!({
            "Post": { "$context": "Style", "title": "string" },
            "Style": { "tone": "string" },
        }))
        .unwrap();
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(200)));
        let drafts = DraftResolver::new(Resolver::new(
            Arc::new(schema),
            provider,
            Arc::new(TemplateGenerator::new()),
        ));

        let err = drafts
            .draft("Post", Map::new(), DraftOptions::default().timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EntigraphError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_resolve_timeout_leaves_draft_unresolved() {
        let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(200)));
        let drafts = drafts(&provider);
        let mut draft = drafts
            .draft("Post", seed(json!({ "title": "Hi" })), DraftOptions::default())
            .await
            .unwrap();

        let err = drafts
            .resolve(&mut draft, ResolveOptions::default().timeout(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EntigraphError::Timeout(_)));
        assert!(draft.is_draft());
        assert!(draft.refs.values().all(|r| !r.resolved));
        assert_eq!(provider.count("Post"), 0);
    }
}
