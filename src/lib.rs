pub mod cascade;
pub mod config;
pub mod draft;
pub mod embeddings;
pub mod entity;
pub mod error;
pub mod generate;
pub mod graph;
pub mod loader;
pub mod provider;
pub mod resolve;
pub mod schema;

pub use cascade::{CascadeGenerator, CascadeReport, CreateOptions, Progress};
pub use config::Config;
pub use draft::{DraftOptions, DraftResolver, ResolveOptions};
pub use entity::{Draft, Entity, FieldRef, Phase};
pub use error::{EntigraphError, Result};
pub use graph::{EntityGraph, GraphScope};
pub use loader::{load_entity, with_loader, Loader, LoaderOptions, LoaderStats};
pub use provider::{MemoryProvider, Provider};
pub use resolve::{MatchOutcome, Resolved, Resolver};
pub use schema::{parse_schema, ParsedSchema, RelationOperator};
