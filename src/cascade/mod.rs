//! Depth-bounded recursive generation of an entity tree.
//!
//! A cascade fills the root's primitive fields, persists it, then walks its
//! relationship fields in declaration order. Forward fields create or match
//! children one hop deeper; backward fields are never generated. The chain
//! of types under construction acts as the visited set, so cyclic schemas
//! terminate.

use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::entity::{value_strings, Entity};
use crate::error::{EntigraphError, Result};
use crate::generate::{
    relation_request, summarize, with_retry, with_timeout, AncestorContext, ContextEntity,
    FieldFiller, RelationRequest,
};
use crate::resolve::Resolver;
use crate::schema::{
    EntitySchema, ParsedField, RelationOperator, RelationshipDescriptor, DEFAULT_FUZZY_THRESHOLD,
};

/// Reported after every entity a cascade persists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub entities_created: usize,
    pub depth: usize,
    pub entity_type: String,
    /// Parent field that led to this entity; `None` for the root.
    pub field: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CreateOptions {
    /// Walk relationship fields and generate missing content. When false the
    /// seed is stored as given.
    pub cascade: bool,
    pub max_depth: Option<usize>,
    pub on_progress: Option<ProgressCallback>,
    pub timeout: Option<Duration>,
}

impl CreateOptions {
    pub fn cascade() -> Self {
        Self {
            cascade: true,
            ..Self::default()
        }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A field a cascade left empty, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnfilledField {
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeReport {
    pub entity: Entity,
    pub entities_created: usize,
    pub unfilled: Vec<UnfilledField>,
}

/// Per-run state. Owned by one `create` call.
struct CascadeContext {
    max_depth: usize,
    array_fanout: usize,
    created: AtomicUsize,
    unfilled: Mutex<Vec<UnfilledField>>,
    on_progress: Option<ProgressCallback>,
}

impl CascadeContext {
    fn record_created(&self, entity: &Entity, depth: usize, field: Option<&str>) {
        let entities_created = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = &self.on_progress {
            callback(&Progress {
                entities_created,
                depth,
                entity_type: entity.entity_type.clone(),
                field: field.map(str::to_string),
            });
        }
    }

    fn record_unfilled(&self, entity_type: &str, entity_id: Option<&str>, field: &str, reason: String) {
        log::warn!("Unfilled {}.{}: {}", entity_type, field, reason);
        let mut unfilled = self.unfilled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unfilled.push(UnfilledField {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.map(str::to_string),
            field: field.to_string(),
            reason,
        });
    }
}

/// One entity to build.
struct BuildJob {
    entity_type: String,
    seed: Map<String, Value>,
    depth: usize,
    via_field: Option<String>,
    /// Types under construction from the root down to the parent.
    chain: Vec<String>,
    ancestors: Vec<AncestorContext>,
}

/// Where one relationship field leads.
struct FieldStep<'a> {
    source: &'a EntitySchema,
    field: &'a ParsedField,
    rel: &'a RelationshipDescriptor,
    entity: &'a Entity,
    depth: usize,
    chain: &'a [String],
    ancestors: &'a [AncestorContext],
    context: &'a [ContextEntity],
}

#[derive(Clone)]
pub struct CascadeGenerator {
    resolver: Resolver,
    max_depth: usize,
    array_fanout: usize,
}

impl CascadeGenerator {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            max_depth: 3,
            array_fanout: 2,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Children generated for an array field with no seeded values.
    pub fn with_array_fanout(mut self, fanout: usize) -> Self {
        self.array_fanout = fanout.max(1);
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub async fn create(
        &self,
        entity_type: &str,
        seed: Map<String, Value>,
        options: CreateOptions,
    ) -> Result<Entity> {
        Ok(self.create_with_report(entity_type, seed, options).await?.entity)
    }

    pub async fn create_with_report(
        &self,
        entity_type: &str,
        seed: Map<String, Value>,
        options: CreateOptions,
    ) -> Result<CascadeReport> {
        self.resolver.schema().require_entity(entity_type)?;

        let ctx = CascadeContext {
            max_depth: options.max_depth.unwrap_or(self.max_depth),
            array_fanout: self.array_fanout,
            created: AtomicUsize::new(0),
            unfilled: Mutex::new(Vec::new()),
            on_progress: options.on_progress.clone(),
        };

        let job = BuildJob {
            entity_type: entity_type.to_string(),
            seed,
            depth: 0,
            via_field: None,
            chain: Vec::new(),
            ancestors: Vec::new(),
        };

        let run = async {
            if options.cascade {
                self.build(&ctx, job).await
            } else {
                self.store(&ctx, job).await
            }
        };
        let entity = with_timeout(options.timeout, run).await?;

        let entities_created = ctx.created.load(Ordering::SeqCst);
        let unfilled = ctx.unfilled.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        log::info!(
            "Created {}/{}: {} entities, {} unfilled fields",
            entity.entity_type,
            entity.id,
            entities_created,
            unfilled.len()
        );

        Ok(CascadeReport {
            entity,
            entities_created,
            unfilled,
        })
    }

    /// Plain create: the seed is persisted as given.
    async fn store(&self, ctx: &CascadeContext, job: BuildJob) -> Result<Entity> {
        let entity = self.resolver.persist(&job.entity_type, None, job.seed).await?;
        ctx.record_created(&entity, job.depth, None);
        Ok(entity)
    }

    fn build<'a>(&'a self, ctx: &'a CascadeContext, job: BuildJob) -> BoxFuture<'a, Result<Entity>> {
        async move {
            let schema = self.resolver.schema().clone();
            let source = schema.require_entity(&job.entity_type)?;

            let mut fields = job.seed;
            for (field, rel) in source.relationships() {
                if rel.operator == RelationOperator::BackwardExact && fields.remove(&field.name).is_some() {
                    log::warn!("Ignoring seeded value for computed field {}.{}", source.name, field.name);
                }
            }

            let context = self.resolver.load_context(source).await?;
            let failures = FieldFiller::new(self.resolver.generator().as_ref(), self.resolver.retry())
                .with_context(&context)
                .fill(source, &mut fields, &job.ancestors)
                .await;

            let entity = self.resolver.persist(&source.name, None, fields).await?;
            ctx.record_created(&entity, job.depth, job.via_field.as_deref());
            for failure in failures {
                ctx.record_unfilled(&source.name, Some(entity.id.as_str()), &failure.field, failure.error.to_string());
            }

            let mut chain = job.chain;
            chain.push(source.name.clone());
            let mut ancestors = job.ancestors;
            ancestors.push(AncestorContext {
                entity_type: source.name.clone(),
                id: entity.id.clone(),
                via_field: job.via_field.clone().unwrap_or_default(),
                summary: summarize(&entity.fields),
            });

            let mut relations = Map::new();
            for (field, rel) in source.relationships() {
                let step = FieldStep {
                    source,
                    field,
                    rel,
                    entity: &entity,
                    depth: job.depth,
                    chain: &chain,
                    ancestors: &ancestors,
                    context: &context,
                };
                if let Some(value) = self.process_field(ctx, &step).await? {
                    relations.insert(field.name.clone(), value);
                }
            }

            if relations.is_empty() {
                return Ok(entity);
            }
            self.resolver.update(&source.name, &entity.id, relations).await
        }
        .boxed()
    }

    /// Settle one relationship field. `Some(value)` is written back to the
    /// entity; `None` leaves the stored value untouched.
    async fn process_field(&self, ctx: &CascadeContext, step: &FieldStep<'_>) -> Result<Option<Value>> {
        let FieldStep { source, field, rel, entity, depth, .. } = *step;
        let target = rel.target_type();

        match rel.operator {
            RelationOperator::BackwardExact => return Ok(None),
            RelationOperator::BackwardFuzzy => {
                self.ground_seeded(ctx, step).await?;
                return Ok(None);
            }
            RelationOperator::ForwardExact if entity.get(&field.name).is_some() => return Ok(None),
            _ => {}
        }

        if depth >= ctx.max_depth {
            log::debug!("{}.{} skipped at depth {}", source.name, field.name, depth);
            return Ok(None);
        }
        if step.chain.iter().any(|t| rel.target_types.contains(t)) {
            log::debug!("{}.{} -> {} would revisit a type under construction", source.name, field.name, target);
            return Ok(None);
        }

        let ids = match rel.operator {
            RelationOperator::ForwardExact => self.create_children(ctx, step).await?,
            RelationOperator::ForwardFuzzy => self.match_or_create_children(ctx, step).await?,
            _ => return Ok(None),
        };
        if ids.is_empty() {
            return Ok(None);
        }

        if field.is_array {
            return Ok(Some(Value::Array(ids.into_iter().map(Value::String).collect())));
        }
        Ok(ids.into_iter().next().map(Value::String))
    }

    fn request(&self, step: &FieldStep<'_>, hint: Option<&str>, count: usize) -> RelationRequest {
        relation_request(
            self.resolver.schema(),
            step.source,
            step.field,
            step.rel.target_type(),
            hint,
            count,
            &step.entity.fields,
            step.ancestors,
        )
        .with_context(step.context)
    }

    fn child_job(&self, step: &FieldStep<'_>, seed: Map<String, Value>) -> BuildJob {
        BuildJob {
            entity_type: step.rel.target_type().to_string(),
            seed,
            depth: step.depth + 1,
            via_field: Some(step.field.name.clone()),
            chain: step.chain.to_vec(),
            ancestors: step.ancestors.to_vec(),
        }
    }

    /// `->` with nothing seeded: ask for seeds, build one child per seed.
    async fn create_children(&self, ctx: &CascadeContext, step: &FieldStep<'_>) -> Result<Vec<String>> {
        let count = if step.field.is_array { ctx.array_fanout } else { 1 };
        let request = self.request(step, None, count);
        let label = format!("{}.{}", step.source.name, step.field.name);

        let seeds = match with_retry(self.resolver.retry(), &label, || {
            self.resolver.generator().generate_seeds(&request)
        })
        .await
        {
            Ok(seeds) => seeds,
            Err(e) if e.is_generation() => {
                ctx.record_unfilled(&step.source.name, Some(step.entity.id.as_str()), &step.field.name, e.to_string());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let children = try_join_all(
            seeds
                .into_iter()
                .take(count)
                .map(|seed| self.build(ctx, self.child_job(step, seed))),
        )
        .await?;
        Ok(children.into_iter().map(|child| child.id).collect())
    }

    /// `~>`: every hint (seeded, or described by the generator) is matched
    /// against existing targets first; misses become new children.
    async fn match_or_create_children(&self, ctx: &CascadeContext, step: &FieldStep<'_>) -> Result<Vec<String>> {
        let label = format!("{}.{}", step.source.name, step.field.name);
        let mut hints = step.entity.get(&step.field.name).map(value_strings).unwrap_or_default();

        if hints.is_empty() {
            let described = if step.field.is_array {
                let request = self.request(step, None, ctx.array_fanout);
                with_retry(self.resolver.retry(), &label, || {
                    self.resolver.generator().generate_seeds(&request)
                })
                .await
                .map(|seeds| seeds.iter().map(summarize_seed).filter(|h| !h.is_empty()).collect::<Vec<_>>())
            } else {
                let request = self.request(step, None, 1);
                with_retry(self.resolver.retry(), &label, || {
                    self.resolver.generator().describe_relation(&request)
                })
                .await
                .map(|hint| vec![hint])
            };
            match described {
                Ok(described) => hints = described,
                Err(e) if e.is_generation() => {
                    ctx.record_unfilled(&step.source.name, Some(step.entity.id.as_str()), &step.field.name, e.to_string());
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            }
        }

        let threshold = step.rel.threshold_or(DEFAULT_FUZZY_THRESHOLD);
        let label = label.as_str();
        let settled = try_join_all(hints.iter().map(|hint| async move {
            if let Some(outcome) = self.resolver.reuse(&step.rel.target_types, hint, threshold).await? {
                return Ok(Some(outcome.into_entity().id));
            }

            let request = self.request(step, Some(hint.as_str()), 1);
            let seeds = match with_retry(self.resolver.retry(), label, || {
                self.resolver.generator().generate_seeds(&request)
            })
            .await
            {
                Ok(seeds) => seeds,
                Err(e) if e.is_generation() => {
                    ctx.record_unfilled(&step.source.name, Some(step.entity.id.as_str()), &step.field.name, e.to_string());
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let seed = seeds.into_iter().next().unwrap_or_default();
            let child = self.build(ctx, self.child_job(step, seed)).await?;
            Ok::<_, EntigraphError>(Some(child.id))
        }))
        .await?;

        Ok(settled.into_iter().flatten().collect())
    }

    /// `<~` hints supplied in the seed are checked against reference data.
    /// Nothing is created; misses are reported as unfilled.
    async fn ground_seeded(&self, ctx: &CascadeContext, step: &FieldStep<'_>) -> Result<()> {
        let hints = step.entity.get(&step.field.name).map(value_strings).unwrap_or_default();
        let threshold = step.rel.threshold_or(DEFAULT_FUZZY_THRESHOLD);

        for hint in hints {
            if self.resolver.ground(&hint, &step.rel.target_types, threshold).await?.is_none() {
                ctx.record_unfilled(
                    &step.source.name,
                    Some(step.entity.id.as_str()),
                    &step.field.name,
                    format!("no reference match for '{}' at >= {}", hint, threshold),
                );
            }
        }
        Ok(())
    }
}

/// Hint text for a generated seed: its first string value.
fn summarize_seed(seed: &Map<String, Value>) -> String {
    seed.values()
        .find_map(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default()
}
