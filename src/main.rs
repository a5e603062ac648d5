//! docflow CLI - inspect schemas and dry-run consolidation

use clap::{Parser, Subcommand};
use docflow::consolidate::Consolidator;
use docflow::storage::memory::MemoryStore;
use docflow::{EngineConfig, SchemaRegistry, WriteIntent};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "docflow")]
#[command(about = "Write orchestration and materialized views for document stores", long_about = None)]
struct Cli {
    /// Schema declaration file
    #[arg(short, long, default_value = "schema.yaml")]
    schema: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the schema and print templates, views and diagnostics
    Compile,

    /// Show which entity a concrete path belongs to
    Entity {
        /// Document path, e.g. users/u1/friends/u2
        path: String,
    },

    /// Consolidate a JSON array of write intents against an empty store
    Consolidate {
        /// JSON file holding the intents
        file: PathBuf,
    },

    /// Parse a view marker and print its normalized form
    CheckMarker {
        /// Marker text, e.g. "View@1.0.0:user:name,email"
        marker: String,
    },

    /// Print the effective engine configuration
    Config {
        /// YAML config file (defaults apply when omitted)
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile => compile(&cli.schema),
        Commands::Entity { path } => show_entity(&cli.schema, &path),
        Commands::Consolidate { file } => consolidate(&cli.schema, &file).await,
        Commands::CheckMarker { marker } => check_marker(&marker),
        Commands::Config { file } => show_config(file.as_deref()),
    }
}

fn compile(schema_path: &Path) -> anyhow::Result<()> {
    let schema = SchemaRegistry::load(schema_path)?;

    println!("Entities:");
    for entity in schema.entities() {
        let doc = schema.doc_path(entity).unwrap_or("-");
        let col = schema.col_path(entity).unwrap_or("-");
        println!("  {:<16} doc: {:<40} col: {}", entity, doc, col);
    }

    let views = schema.view_definitions();
    if !views.is_empty() {
        println!();
        println!("Views:");
        for def in views {
            let sync = if def.options.sync_create { " syncCreate" } else { "" };
            println!("  {} @{} [{}]{}", def.forward_name(), def.version, def.src_props.join(", "), sync);
        }
    }

    let peers = schema.peer_sync_definitions();
    if !peers.is_empty() {
        println!();
        println!("Peer sync:");
        for def in peers {
            println!("  {} @{} [{}]", def.name(), def.version, def.props.join(", "));
        }
    }

    let diagnostics = schema.diagnostics();
    if !diagnostics.is_empty() {
        println!();
        println!("Diagnostics:");
        for diagnostic in diagnostics {
            println!("  ! {}", diagnostic);
        }
    }

    Ok(())
}

fn show_entity(schema_path: &Path, path: &str) -> anyhow::Result<()> {
    let schema = SchemaRegistry::load(schema_path)?;
    docflow::validation::validate_doc_path(path).map_err(docflow::Error::from)?;
    match schema.entity_of(path) {
        Some(entity) => println!("{} -> {}", path, entity),
        None => {
            let err = docflow::Error::UnknownPath { path: path.to_string() };
            println!("{}", err);
            if let Some(hint) = err.suggestion() {
                println!("  hint: {}", hint);
            }
        }
    }
    Ok(())
}

async fn consolidate(schema_path: &Path, file: &Path) -> anyhow::Result<()> {
    let schema = SchemaRegistry::load(schema_path)?;
    let content = std::fs::read_to_string(file)?;
    let intents: Vec<WriteIntent> = serde_json::from_str(&content)?;

    let store = MemoryStore::new();
    let writes = Consolidator::new(&schema, &store).consolidate_intents(intents).await?;

    println!("{}", serde_json::to_string_pretty(&writes.ordered())?);
    if !writes.forms.is_empty() {
        println!("Forms:");
        println!("{}", serde_json::to_string_pretty(&writes.forms)?);
    }
    if !writes.conflicts.is_empty() {
        println!("Conflicts:");
        for conflict in &writes.conflicts {
            println!("  {}", serde_json::to_string(conflict)?);
        }
    }
    Ok(())
}

fn check_marker(marker: &str) -> anyhow::Result<()> {
    let parsed = viewmark::parse(marker)?;
    println!("{}", parsed);
    println!("  kind:    {}", parsed.kind.keyword());
    if let Some(version) = &parsed.version {
        println!("  version: {}", version);
    }
    if let Some(entity) = &parsed.src_entity {
        println!("  source:  {}", entity);
    }
    println!("  props:   {}", parsed.props.join(", "));
    for option in &parsed.options {
        println!("  option:  {}={}", option.name, option.value);
    }
    Ok(())
}

fn show_config(file: Option<&Path>) -> anyhow::Result<()> {
    let config = match file {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
