//! Relationship resolution for the four operators.
//!
//! `Resolver::resolve(entity, field)` is the explicit accessor for a
//! relationship field. Nothing is memoised on the entity; every call
//! resolves again and relies on the loader cache for repeat lookups.

use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::entity::{value_strings, Entity};
use crate::error::{EntigraphError, Result};
use crate::generate::{
    context_entity, relation_request, stamp_timestamps, with_retry, ContentGenerator,
    ContextEntity, FieldFiller, RelationRequest, RetryPolicy,
};
use crate::loader::{load_entity, Loader};
use crate::provider::{Filter, ListOptions, Provider, ScoredEntity, SemanticSearchOptions};
use crate::schema::{EntitySchema, ParsedSchema, RelationOperator, DEFAULT_FUZZY_THRESHOLD};

/// Entities listed per `$context` type.
const CONTEXT_LIMIT: usize = 20;

/// Outcome of resolving one relationship field.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    None,
    One(Entity),
    /// Entities that exist, in stored order. Ids with no entity behind them
    /// are skipped, so positions need not line up with the stored ids; use
    /// `Loader::load_many` for a positional view with `None` gaps.
    Many(Vec<Entity>),
}

impl Resolved {
    pub fn is_none(&self) -> bool {
        matches!(self, Resolved::None)
    }

    pub fn one(&self) -> Option<&Entity> {
        match self {
            Resolved::One(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Resolved::None => 0,
            Resolved::One(_) => 1,
            Resolved::Many(entities) => entities.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<Entity> {
        match self {
            Resolved::None => Vec::new(),
            Resolved::One(entity) => vec![entity],
            Resolved::Many(entities) => entities,
        }
    }
}

/// How a fuzzy-forward value was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The value was already the id of a target entity.
    Existing(Entity),
    /// Semantic search found a target at or above the threshold.
    Matched(ScoredEntity),
    /// Nothing matched; a new target was generated and persisted.
    Created(Entity),
}

impl MatchOutcome {
    pub fn entity(&self) -> &Entity {
        match self {
            MatchOutcome::Existing(entity) | MatchOutcome::Created(entity) => entity,
            MatchOutcome::Matched(hit) => &hit.entity,
        }
    }

    pub fn into_entity(self) -> Entity {
        match self {
            MatchOutcome::Existing(entity) | MatchOutcome::Created(entity) => entity,
            MatchOutcome::Matched(hit) => hit.entity,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, MatchOutcome::Created(_))
    }
}

#[derive(Clone)]
pub struct Resolver {
    schema: Arc<ParsedSchema>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn ContentGenerator>,
    loader: Option<Loader>,
    search_limit: usize,
    retry: RetryPolicy,
    auto_timestamps: bool,
}

impl Resolver {
    pub fn new(
        schema: Arc<ParsedSchema>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        Self {
            schema,
            provider,
            generator,
            loader: None,
            search_limit: 10,
            retry: RetryPolicy::default(),
            auto_timestamps: true,
        }
    }

    /// Route point lookups through `loader`.
    pub fn with_loader(mut self, loader: Loader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_auto_timestamps(mut self, enabled: bool) -> Self {
        self.auto_timestamps = enabled;
        self
    }

    pub fn schema(&self) -> &Arc<ParsedSchema> {
        &self.schema
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn generator(&self) -> &Arc<dyn ContentGenerator> {
        &self.generator
    }

    pub fn loader(&self) -> Option<&Loader> {
        self.loader.as_ref()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Point lookup through the loader when one is attached.
    pub async fn load(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        load_entity(self.provider.as_ref(), self.loader.as_ref(), entity_type, id).await
    }

    /// First hit for `id` across `targets`, in declaration order.
    pub async fn load_any(&self, targets: &[String], id: &str) -> Result<Option<Entity>> {
        if let [only] = targets {
            return self.load(only, id).await;
        }
        for target in targets {
            if let Some(entity) = self.load(target, id).await? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Existing entities of the `$context` types of `schema`, in provider
    /// order, at most `CONTEXT_LIMIT` per type.
    pub async fn load_context(&self, schema: &EntitySchema) -> Result<Vec<ContextEntity>> {
        let options = ListOptions {
            limit: Some(CONTEXT_LIMIT),
            offset: 0,
        };
        let mut context = Vec::new();
        for context_type in &schema.context_types {
            let entities = self.provider.list(context_type, &options).await?;
            context.extend(entities.iter().map(context_entity));
        }
        Ok(context)
    }

    /// Resolve relationship `field` of `entity`.
    pub async fn resolve(&self, entity: &Entity, field: &str) -> Result<Resolved> {
        let source = self.schema.require_entity(&entity.entity_type)?;
        let rel = self.schema.descriptor(&entity.entity_type, field)?;
        let parsed = source.field(field).ok_or_else(|| {
            EntigraphError::Schema(format!("{} has no field '{}'", entity.entity_type, field))
        })?;
        let is_array = parsed.is_array;

        let resolved = match rel.operator {
            RelationOperator::ForwardExact => {
                let ids = entity.ids(field);
                let found = try_join_all(ids.iter().map(|id| self.load_any(&rel.target_types, id))).await?;
                collect(found.into_iter().flatten().collect(), is_array)
            }
            RelationOperator::ForwardFuzzy => {
                let hints = entity.get(field).map(value_strings).unwrap_or_default();
                let threshold = rel.threshold_or(DEFAULT_FUZZY_THRESHOLD);
                let context = self.load_context(source).await?;
                let settled = try_join_all(hints.iter().map(|hint| {
                    let request = relation_request(
                        &self.schema,
                        source,
                        parsed,
                        rel.target_type(),
                        Some(hint.as_str()),
                        1,
                        &entity.fields,
                        &[],
                    )
                    .with_context(&context);
                    async move {
                        self.match_or_create(&rel.target_types, &request, threshold)
                            .await
                            .map(MatchOutcome::into_entity)
                    }
                }))
                .await?;
                collect(settled, is_array)
            }
            RelationOperator::BackwardExact => {
                let Some(backref) = rel.backref_field.as_deref() else {
                    return Ok(Resolved::Many(Vec::new()));
                };
                let mut filter = Filter::new();
                filter.insert(backref.to_string(), Value::String(entity.id.clone()));
                let mut found = Vec::new();
                for target in &rel.target_types {
                    found.extend(
                        self.provider
                            .search(target, &filter, &ListOptions::default())
                            .await?,
                    );
                }
                Resolved::Many(found)
            }
            RelationOperator::BackwardFuzzy => {
                let hints = entity.get(field).map(value_strings).unwrap_or_default();
                let threshold = rel.threshold_or(DEFAULT_FUZZY_THRESHOLD);
                let grounded =
                    try_join_all(hints.iter().map(|hint| self.ground(hint, &rel.target_types, threshold))).await?;
                collect(grounded.into_iter().flatten().map(|hit| hit.entity).collect(), is_array)
            }
        };

        log::debug!(
            "Resolved {}/{}.{} ({}): {} entities",
            entity.entity_type,
            entity.id,
            field,
            rel.operator.token(),
            resolved.len()
        );
        Ok(resolved)
    }

    /// Best match for `hint` across `targets` at or above `threshold`.
    ///
    /// Hits from every target type are merged and stably sorted by score, so
    /// ties go to the earlier type in `targets` and then to provider order.
    /// Never creates anything.
    pub async fn ground(
        &self,
        hint: &str,
        targets: &[String],
        threshold: f32,
    ) -> Result<Option<ScoredEntity>> {
        if hint.trim().is_empty() {
            return Ok(None);
        }

        let options = SemanticSearchOptions {
            limit: self.search_limit,
            min_score: threshold,
        };
        let mut hits = Vec::new();
        for target in targets {
            hits.extend(self.provider.semantic_search(target, hint, options).await?);
        }
        hits.retain(|hit| hit.score >= threshold);
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let best = hits.into_iter().next();
        match &best {
            Some(hit) => log::debug!(
                "Grounded '{}' to {}/{} (score {:.3})",
                hint,
                hit.entity.entity_type,
                hit.entity.id,
                hit.score
            ),
            None => log::debug!("No match for '{}' in {:?} at >= {}", hint, targets, threshold),
        }
        Ok(best)
    }

    /// Reuse side of create-or-reuse: the value as an existing target id,
    /// else the best semantic match, which is primed into the loader.
    pub async fn reuse(
        &self,
        targets: &[String],
        hint: &str,
        threshold: f32,
    ) -> Result<Option<MatchOutcome>> {
        if !hint.is_empty() && !hint.contains(char::is_whitespace) {
            if let Some(existing) = self.load_any(targets, hint).await? {
                return Ok(Some(MatchOutcome::Existing(existing)));
            }
        }

        if let Some(hit) = self.ground(hint, targets, threshold).await? {
            if let Some(loader) = &self.loader {
                loader.prime(&hit.entity.entity_type, &hit.entity.id, Some(hit.entity.clone()));
            }
            return Ok(Some(MatchOutcome::Matched(hit)));
        }
        Ok(None)
    }

    /// Create-or-reuse for a fuzzy-forward value. When nothing can be
    /// reused a new target is generated from the hint and persisted, so
    /// this never reports "not found".
    pub async fn match_or_create(
        &self,
        targets: &[String],
        request: &RelationRequest,
        threshold: f32,
    ) -> Result<MatchOutcome> {
        let hint = request.hint.as_deref().unwrap_or_default();
        if let Some(outcome) = self.reuse(targets, hint, threshold).await? {
            return Ok(outcome);
        }
        let created = self.create_from_hint(request).await?;
        Ok(MatchOutcome::Created(created))
    }

    /// Generate a target entity from a relation request and persist it.
    /// Its own relationship fields are left for a cascade to fill.
    pub async fn create_from_hint(&self, request: &RelationRequest) -> Result<Entity> {
        let target = self.schema.require_entity(&request.target_type)?;
        let label = format!("{}.{} seed", request.source_type, request.field);

        let mut seeds = with_retry(self.retry, &label, || {
            self.generator.generate_seeds(request)
        })
        .await?;
        let mut fields = if seeds.is_empty() {
            Map::new()
        } else {
            seeds.swap_remove(0)
        };

        let context = self.load_context(target).await?;
        FieldFiller::new(self.generator.as_ref(), self.retry)
            .with_context(&context)
            .fill(target, &mut fields, &request.ancestors)
            .await;

        self.persist(&target.name, None, fields).await
    }

    /// Stamp timestamps, assign an id when none is given, create, and prime
    /// the loader with the stored entity.
    pub async fn persist(
        &self,
        entity_type: &str,
        id: Option<&str>,
        mut fields: Map<String, Value>,
    ) -> Result<Entity> {
        let schema = self.schema.require_entity(entity_type)?;
        if self.auto_timestamps {
            stamp_timestamps(schema, &mut fields, true);
        }
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let created = self.provider.create(entity_type, &id, fields).await?;
        if let Some(loader) = &self.loader {
            loader.clear(Some(entity_type), Some(id.as_str()));
            loader.prime(entity_type, &id, Some(created.clone()));
        }
        log::debug!("Created {}/{}", entity_type, id);
        Ok(created)
    }

    /// Merge `fields` into a stored entity and refresh the loader entry.
    pub async fn update(
        &self,
        entity_type: &str,
        id: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Entity> {
        let schema = self.schema.require_entity(entity_type)?;
        if self.auto_timestamps {
            stamp_timestamps(schema, &mut fields, false);
        }
        let updated = self.provider.update(entity_type, id, fields).await?;
        if let Some(loader) = &self.loader {
            loader.clear(Some(entity_type), Some(id));
            loader.prime(entity_type, id, Some(updated.clone()));
        }
        Ok(updated)
    }
}

fn collect(entities: Vec<Entity>, is_array: bool) -> Resolved {
    if is_array {
        return Resolved::Many(entities);
    }
    match entities.into_iter().next() {
        Some(entity) => Resolved::One(entity),
        None => Resolved::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::TemplateGenerator;
    use crate::provider::MemoryProvider;
    use crate::schema::parse_schema;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn schema() -> Arc<ParsedSchema> {
        Arc::new(
            parse_schema(&json!({
                "Author": { "name": "string", "posts": "<-Post.author" },
                "Post": {
                    "title": "string",
                    "author": "->Author",
                    "tags": ["->Tag"],
                    "category": "~>Category(0.6)",
                    "occupation": "<~Occupation(0.7)",
                    "tool": "<~Tool|Software(0.5)",
                },
                "Tag": { "name": "string" },
                "Category": { "name": "string" },
                "Occupation": { "title": "string" },
                "Tool": { "name": "string" },
                "Software": { "name": "string" },
            }))
            .unwrap(),
        )
    }

    fn resolver(provider: &Arc<MemoryProvider>) -> Resolver {
        Resolver::new(schema(), provider.clone(), Arc::new(TemplateGenerator::new()))
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_forward_exact_single_and_missing() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Author", "a1", fields(json!({ "name": "Jane" }))).await.unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "author": "a1" })));
        let author = resolver.resolve(&post, "author").await.unwrap();
        assert_eq!(author.one().unwrap().get_str("name"), Some("Jane"));

        let orphan = Entity::new("Post", "p2", fields(json!({ "author": "gone" })));
        assert!(resolver.resolve(&orphan, "author").await.unwrap().is_none());

        let unset = Entity::new("Post", "p3", Map::new());
        assert!(resolver.resolve(&unset, "author").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forward_exact_array_preserves_order_and_skips_missing() {
        let provider = Arc::new(MemoryProvider::new());
        for (id, name) in [("t1", "rust"), ("t2", "async")] {
            provider.create("Tag", id, fields(json!({ "name": name }))).await.unwrap();
        }
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "tags": ["t2", "nope", "t1"] })));
        let tags = resolver.resolve(&post, "tags").await.unwrap().into_vec();
        let names: Vec<_> = tags.iter().filter_map(|t| t.get_str("name")).collect();
        assert_eq!(names, vec!["async", "rust"]);
    }

    #[tokio::test]
    async fn test_repeated_resolution_hits_provider_once_per_id() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Author", "a1", fields(json!({ "name": "Jane" }))).await.unwrap();
        let loader = Loader::new(provider.clone());
        let resolver = resolver(&provider).with_loader(loader.clone());

        let post = Entity::new("Post", "p1", fields(json!({ "author": "a1" })));
        let first = resolver.resolve(&post, "author").await.unwrap();
        let second = resolver.resolve(&post, "author").await.unwrap();
        let direct = loader.load("Author", "a1").await.unwrap();

        assert_eq!(first.one(), direct.as_ref());
        assert_eq!(first, second);
        assert_eq!(provider.calls().get, 1);
    }

    #[tokio::test]
    async fn test_backward_exact_is_live_query() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Author", "a1", fields(json!({ "name": "Jane" }))).await.unwrap();
        let resolver = resolver(&provider);
        let author = provider.get("Author", "a1").await.unwrap().unwrap();

        assert!(resolver.resolve(&author, "posts").await.unwrap().is_empty());

        provider
            .create("Post", "p1", fields(json!({ "title": "Hi", "author": "a1" })))
            .await
            .unwrap();
        let posts = resolver.resolve(&author, "posts").await.unwrap().into_vec();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "p1");
        assert!(author.get("posts").is_none());
    }

    #[tokio::test]
    async fn test_backward_fuzzy_grounds_without_creating() {
        let provider = Arc::new(MemoryProvider::new());
        provider
            .create("Occupation", "o1", fields(json!({ "title": "Software Engineer" })))
            .await
            .unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "occupation": "software engineer" })));
        let grounded = resolver.resolve(&post, "occupation").await.unwrap();
        assert_eq!(grounded.one().unwrap().id, "o1");

        let miss = Entity::new("Post", "p2", fields(json!({ "occupation": "pastry chef" })));
        assert!(resolver.resolve(&miss, "occupation").await.unwrap().is_none());
        assert_eq!(provider.count("Occupation"), 1);
        assert_eq!(provider.calls().create, 1);
    }

    #[tokio::test]
    async fn test_fuzzy_against_empty_collection_is_no_match() {
        let provider = Arc::new(MemoryProvider::new());
        let resolver = resolver(&provider);
        let hit = resolver
            .ground("anything", &["Occupation".to_string()], 0.0)
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn test_ground_union_ties_go_to_first_declared_type() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Software", "s1", fields(json!({ "name": "Figma" }))).await.unwrap();
        provider.create("Tool", "t1", fields(json!({ "name": "Figma" }))).await.unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "tool": "figma" })));
        for _ in 0..3 {
            let grounded = resolver.resolve(&post, "tool").await.unwrap();
            assert_eq!(grounded.one().unwrap().entity_type, "Tool");
        }
    }

    #[tokio::test]
    async fn test_stricter_threshold_never_matches_more() {
        let provider = Arc::new(MemoryProvider::new());
        for (id, title) in [("o1", "Software Engineer"), ("o2", "Software Tester"), ("o3", "Chef")] {
            provider.create("Occupation", id, fields(json!({ "title": title }))).await.unwrap();
        }
        let targets = vec!["Occupation".to_string()];
        let options = |min_score: f32| SemanticSearchOptions { limit: 10, min_score };

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let count = provider
                .semantic_search("Occupation", "software engineer", options(threshold))
                .await
                .unwrap()
                .len();
            assert!(count <= previous);
            previous = count;
        }

        let resolver = resolver(&provider);
        assert!(resolver.ground("software engineer", &targets, 0.9).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forward_fuzzy_reuses_match() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Category", "c1", fields(json!({ "name": "Systems Programming" }))).await.unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "category": "systems programming" })));
        let category = resolver.resolve(&post, "category").await.unwrap();
        assert_eq!(category.one().unwrap().id, "c1");
        assert_eq!(provider.count("Category"), 1);
    }

    #[tokio::test]
    async fn test_forward_fuzzy_creates_when_nothing_matches() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Category", "c1", fields(json!({ "name": "Cooking" }))).await.unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "category": "Distributed Systems" })));
        let category = resolver.resolve(&post, "category").await.unwrap();
        let created = category.one().unwrap();
        assert_ne!(created.id, "c1");
        assert_eq!(created.get_str("name"), Some("Distributed Systems"));
        assert!(created.get("createdAt").is_some());
        assert_eq!(provider.count("Category"), 2);

        // The created category now grounds the same description.
        let again = resolver.resolve(&post, "category").await.unwrap();
        assert_eq!(again.one().unwrap().id, created.id);
        assert_eq!(provider.count("Category"), 2);
    }

    #[tokio::test]
    async fn test_context_types_reach_generator() {
        let schema = Arc::new(
            parse_schema(&json!({
                "Post": { "title": "string", "category": "~>Category" },
                "Category": { "$context": ["Topic"], "name": "string", "blurb": "One line blurb" },
                "Topic": { "name": "string" },
            }))
            .unwrap(),
        );
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Topic", "t1", fields(json!({ "name": "Rust" }))).await.unwrap();
        provider.create("Topic", "t2", fields(json!({ "name": "Go" }))).await.unwrap();
        let generator = Arc::new(TemplateGenerator::new());
        let resolver = Resolver::new(schema.clone(), provider.clone(), generator.clone())
            .with_retry(RetryPolicy::none());

        let context = resolver.load_context(schema.entity("Category").unwrap()).await.unwrap();
        let ids: Vec<&str> = context.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert!(resolver.load_context(schema.entity("Post").unwrap()).await.unwrap().is_empty());

        let post = Entity::new("Post", "p1", fields(json!({ "category": "Systems languages" })));
        resolver.resolve(&post, "category").await.unwrap();
        assert_eq!(generator.context_seen(), vec!["Topic/t1", "Topic/t2"]);
    }

    #[tokio::test]
    async fn test_forward_fuzzy_accepts_existing_id() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Category", "c9", fields(json!({ "name": "Databases" }))).await.unwrap();
        let resolver = resolver(&provider);

        let post = Entity::new("Post", "p1", fields(json!({ "category": "c9" })));
        let category = resolver.resolve(&post, "category").await.unwrap();
        assert_eq!(category.one().unwrap().id, "c9");
        assert_eq!(provider.calls().semantic_search, 0);
    }

    #[tokio::test]
    async fn test_match_primes_loader() {
        let provider = Arc::new(MemoryProvider::new());
        provider.create("Category", "c1", fields(json!({ "name": "Systems Programming" }))).await.unwrap();
        let loader = Loader::new(provider.clone());
        let resolver = resolver(&provider).with_loader(loader.clone());

        let post = Entity::new("Post", "p1", fields(json!({ "category": "systems programming" })));
        resolver.resolve(&post, "category").await.unwrap();
        let gets_before = provider.calls().get;

        loader.load("Category", "c1").await.unwrap().unwrap();
        assert_eq!(provider.calls().get, gets_before);
    }

    #[tokio::test]
    async fn test_non_relationship_field_is_schema_error() {
        let provider = Arc::new(MemoryProvider::new());
        let resolver = resolver(&provider);
        let post = Entity::new("Post", "p1", fields(json!({ "title": "Hi" })));
        assert!(resolver.resolve(&post, "title").await.is_err());
    }
}
