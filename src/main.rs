use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use entigraph::cascade::CreateOptions;
use entigraph::draft::{DraftOptions, ResolveOptions};
use entigraph::schema::{FieldKind, ParsedSchema};
use entigraph::{Config, EntityGraph};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "entigraph")]
#[command(about = "Schema-driven entity graph: validate schemas and generate entity trees")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a schema, then print its relationship table
    Check {
        /// Schema file (YAML or JSON); defaults to graph.schema_path
        schema: Option<PathBuf>,
    },
    /// Generate an entity tree against the in-memory provider
    Generate {
        /// Schema file (YAML or JSON)
        schema: PathBuf,
        /// Entity type to create
        entity_type: String,
        /// Seed fields as a JSON object
        #[arg(long)]
        seed: Option<String>,
        /// Maximum relationship hops from the root
        #[arg(long)]
        max_depth: Option<usize>,
        /// Produce a draft, print it, then resolve it
        #[arg(long)]
        draft: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Logs go to stderr; stdout carries JSON output only
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.graph.log_level.as_str())
    ).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check { schema } => {
            let path = schema
                .or_else(|| config.schema_path().map(Path::to_path_buf))
                .context("No schema given and graph.schema_path is not set")?;
            run_check(&config, &path)
        }
        Command::Generate {
            schema,
            entity_type,
            seed,
            max_depth,
            draft,
        } => run_generate(config, &schema, &entity_type, seed.as_deref(), max_depth, draft).await,
    }
}

fn load_schema(config: &Config, path: &Path) -> Result<ParsedSchema> {
    config
        .schema_parser()
        .parse_file(path)
        .with_context(|| format!("Invalid schema: {}", path.display()))
}

fn run_check(config: &Config, path: &Path) -> Result<()> {
    let schema = load_schema(config, path)?;
    log::info!("Schema {} is valid: {} entity types", path.display(), schema.len());

    for entity in schema.entities() {
        println!("{}", entity.name);
        for field in &entity.fields {
            match &field.kind {
                FieldKind::Relationship(rel) => {
                    let threshold = rel
                        .threshold
                        .map(|t| format!(" ({:.2})", t))
                        .unwrap_or_default();
                    let backref = rel
                        .backref_field
                        .as_deref()
                        .map(|b| format!(" via {}", b))
                        .unwrap_or_default();
                    let synthesized = if field.synthesized { " [synthesized]" } else { "" };
                    println!(
                        "  {:<20} {} {}{}{}{}{}",
                        field.name,
                        rel.operator.token(),
                        rel.target_types.join("|"),
                        if field.is_array { "[]" } else { "" },
                        threshold,
                        backref,
                        synthesized
                    );
                }
                FieldKind::Primitive(primitive) => {
                    println!("  {:<20} {:?}{}", field.name, primitive, if field.is_array { "[]" } else { "" });
                }
            }
        }
    }
    Ok(())
}

async fn run_generate(
    config: Config,
    path: &Path,
    entity_type: &str,
    seed: Option<&str>,
    max_depth: Option<usize>,
    draft: bool,
) -> Result<()> {
    let schema = load_schema(&config, path)?;
    let seed: Map<String, Value> = match seed {
        Some(raw) => serde_json::from_str(raw).context("--seed must be a JSON object")?,
        None => Map::new(),
    };

    let graph = EntityGraph::in_memory(Arc::new(schema), config, None);

    if draft {
        let mut draft = graph.draft(entity_type, seed, DraftOptions::default()).await?;
        println!("{}", serde_json::to_string_pretty(&draft)?);

        let options = ResolveOptions::on_resolved(|field: &str, id: &str| {
            log::info!("Resolved {} -> {}", field, id);
        });
        let entity = graph.resolve_draft(&mut draft, options).await?;
        println!("{}", serde_json::to_string_pretty(&entity)?);
        return Ok(());
    }

    let mut options = CreateOptions::cascade().on_progress(|progress| {
        log::info!(
            "{} entities created (depth {}, {}{})",
            progress.entities_created,
            progress.depth,
            progress.entity_type,
            progress
                .field
                .as_deref()
                .map(|f| format!(" via {}", f))
                .unwrap_or_default()
        );
    });
    if let Some(depth) = max_depth {
        options = options.max_depth(depth);
    }

    let report = graph.create_with_report(entity_type, seed, options).await?;
    for unfilled in &report.unfilled {
        log::warn!("Unfilled {}.{}: {}", unfilled.entity_type, unfilled.field, unfilled.reason);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
