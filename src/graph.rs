//! Entry point tying schema, provider, generator and configuration together.
//!
//! Every top-level call runs in its own [`GraphScope`] with a fresh loader.
//! Callers that want several operations to share one loader cache (one
//! request, one job) use [`EntityGraph::with_loader`].

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

use crate::cascade::{CascadeGenerator, CascadeReport, CreateOptions};
use crate::config::Config;
use crate::draft::{DraftOptions, DraftResolver, ResolveOptions};
use crate::embeddings::Embedder;
use crate::entity::{Draft, Entity};
use crate::error::{EntigraphError, Result};
use crate::generate::{ContentGenerator, TemplateGenerator};
use crate::loader::{self, Loader, LoaderOptions};
use crate::provider::{MemoryProvider, Provider};
use crate::resolve::{Resolved, Resolver};
use crate::schema::ParsedSchema;

pub struct EntityGraph {
    schema: Arc<ParsedSchema>,
    provider: Arc<dyn Provider>,
    generator: Arc<dyn ContentGenerator>,
    config: Config,
}

impl EntityGraph {
    pub fn new(
        schema: Arc<ParsedSchema>,
        provider: Arc<dyn Provider>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        Self {
            schema,
            provider,
            generator,
            config: Config::default(),
        }
    }

    /// In-memory graph: `MemoryProvider` sized from `[embeddings]` and the
    /// template generator.
    pub fn in_memory(schema: Arc<ParsedSchema>, config: Config, embedder: Option<Arc<dyn Embedder>>) -> Self {
        let provider = MemoryProvider::with_embedder(
            embedder,
            config.embeddings.dimensions,
            config.embeddings.cache_capacity,
        );
        Self::new(schema, Arc::new(provider), Arc::new(TemplateGenerator::new())).with_config(config)
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &Arc<ParsedSchema> {
        &self.schema
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fresh loader configured from `[loader]`.
    pub fn loader(&self) -> Loader {
        Loader::with_options(
            self.provider.clone(),
            LoaderOptions {
                cache: self.config.loader.cache,
            },
        )
    }

    /// Scope bound to `loader`.
    pub fn scope_with(&self, loader: Loader) -> GraphScope {
        let resolver = Resolver::new(self.schema.clone(), self.provider.clone(), self.generator.clone())
            .with_loader(loader)
            .with_search_limit(self.config.fuzzy.search_limit)
            .with_retry(self.config.cascade.retry_policy())
            .with_auto_timestamps(self.config.graph.auto_timestamps);
        let cascade = CascadeGenerator::new(resolver.clone())
            .with_max_depth(self.config.cascade.max_depth)
            .with_array_fanout(self.config.cascade.array_fanout);

        GraphScope {
            drafts: DraftResolver::new(resolver.clone()),
            cascade,
            resolver,
            default_timeout: self.config.cascade.timeout(),
        }
    }

    pub fn scope(&self) -> GraphScope {
        self.scope_with(self.loader())
    }

    /// Run `f` with a scope whose loader lives exactly as long as `f`.
    pub async fn with_loader<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(GraphScope) -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.config.loader.cache {
            return f(self.scope()).await;
        }
        loader::with_loader(self.provider.clone(), |loader| f(self.scope_with(loader))).await
    }

    pub async fn create(&self, entity_type: &str, seed: Map<String, Value>, options: CreateOptions) -> Result<Entity> {
        self.scope().create(entity_type, seed, options).await
    }

    pub async fn create_with_report(
        &self,
        entity_type: &str,
        seed: Map<String, Value>,
        options: CreateOptions,
    ) -> Result<CascadeReport> {
        self.scope().create_with_report(entity_type, seed, options).await
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        self.scope().get(entity_type, id).await
    }

    pub async fn resolve(&self, entity: &Entity, field: &str) -> Result<Resolved> {
        self.scope().resolve(entity, field).await
    }

    pub async fn draft(&self, entity_type: &str, seed: Map<String, Value>, options: DraftOptions) -> Result<Draft> {
        self.scope().draft(entity_type, seed, options).await
    }

    pub async fn resolve_draft(&self, draft: &mut Draft, options: ResolveOptions) -> Result<Entity> {
        self.scope().resolve_draft(draft, options).await
    }
}

/// Graph operations sharing one loader.
#[derive(Clone)]
pub struct GraphScope {
    resolver: Resolver,
    cascade: CascadeGenerator,
    drafts: DraftResolver,
    default_timeout: Option<std::time::Duration>,
}

impl GraphScope {
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn loader(&self) -> Option<&Loader> {
        self.resolver.loader()
    }

    pub async fn create(&self, entity_type: &str, seed: Map<String, Value>, options: CreateOptions) -> Result<Entity> {
        Ok(self.create_with_report(entity_type, seed, options).await?.entity)
    }

    pub async fn create_with_report(
        &self,
        entity_type: &str,
        seed: Map<String, Value>,
        mut options: CreateOptions,
    ) -> Result<CascadeReport> {
        if options.timeout.is_none() {
            options.timeout = self.default_timeout;
        }
        self.cascade.create_with_report(entity_type, seed, options).await
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        self.resolver.schema().require_entity(entity_type)?;
        self.resolver.load(entity_type, id).await
    }

    /// Like `get`, but a missing entity is `NotFound`.
    pub async fn require(&self, entity_type: &str, id: &str) -> Result<Entity> {
        self.get(entity_type, id)
            .await?
            .ok_or_else(|| EntigraphError::NotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            })
    }

    pub async fn resolve(&self, entity: &Entity, field: &str) -> Result<Resolved> {
        self.resolver.resolve(entity, field).await
    }

    pub async fn draft(&self, entity_type: &str, seed: Map<String, Value>, mut options: DraftOptions) -> Result<Draft> {
        if options.timeout.is_none() {
            options.timeout = self.default_timeout;
        }
        self.drafts.draft(entity_type, seed, options).await
    }

    pub async fn resolve_draft(&self, draft: &mut Draft, mut options: ResolveOptions) -> Result<Entity> {
        if options.timeout.is_none() {
            options.timeout = self.default_timeout;
        }
        self.drafts.resolve(draft, options).await
    }
}
