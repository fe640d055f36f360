//! Strata CLI - inspect and edit a file-backed sync cache.
//!
//! Writes made here are recorded as local changes and pushed by the next
//! sync of a client using the same cache file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use strata_common::{Node, NodePath};
use strata_storage::{create_default_registry, Status};
use strata_sync::{classify, LocalCache, NodeStatus, SyncConfig};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - offline-first sync cache")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Cache file (default: <data dir>/strata/cache.json).
    #[arg(short, long, global = true)]
    cache: Option<PathBuf>,

    /// JSON sync configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the items of a folder.
    Ls {
        /// Folder path.
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print a document.
    Get {
        /// Document path.
        path: String,

        /// Write the body to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a document.
    Put {
        /// Document path.
        path: String,

        /// Source file to store.
        #[arg(short, long, conflicts_with = "data")]
        file: Option<PathBuf>,

        /// Inline body.
        #[arg(short, long)]
        data: Option<String>,

        #[arg(short = 't', long, default_value = "text/plain")]
        content_type: String,
    },

    /// Delete a document.
    Rm {
        /// Document path.
        path: String,
    },

    /// Drop cached data below a path.
    Flush {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show nodes that are not in sync.
    Pending,

    /// Print the raw cached node for a path.
    Dump {
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let cache_file = match cli.cache {
        Some(file) => file,
        None => default_cache_file()?,
    };
    let cache = open_cache(&cache_file, &config).await?;

    match cli.command {
        Commands::Ls { path } => cmd_ls(&cache, &path).await,
        Commands::Get { path, output } => cmd_get(&cache, &path, output.as_deref()).await,
        Commands::Put {
            path,
            file,
            data,
            content_type,
        } => cmd_put(&cache, &path, file.as_deref(), data, &content_type).await,
        Commands::Rm { path } => cmd_rm(&cache, &path).await,
        Commands::Flush { path } => cmd_flush(&cache, &path).await,
        Commands::Pending => cmd_pending(&cache).await,
        Commands::Dump { path } => cmd_dump(&cache, &path).await,
    }
}

fn default_cache_file() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("No data directory on this platform; pass --cache")?;
    Ok(dir.join("strata").join("cache.json"))
}

async fn open_cache(file: &Path, config: &SyncConfig) -> Result<LocalCache> {
    let registry = create_default_registry();
    let store = registry
        .resolve("file", serde_json::json!({ "path": file }))
        .await
        .with_context(|| format!("Failed to open cache {}", file.display()))?;
    Ok(LocalCache::new(store, config))
}

fn parse_path(path: &str) -> Result<NodePath> {
    NodePath::parse(path).with_context(|| format!("Invalid path: {}", path))
}

/// List folder contents.
async fn cmd_ls(cache: &LocalCache, path: &str) -> Result<()> {
    let folder = parse_path(path)?;
    anyhow::ensure!(folder.is_folder(), "{} is not a folder (paths end in /)", path);

    let response = cache.get_cached(&folder).await?;
    if response.status == Status::NOT_FOUND {
        println!("Folder is not cached.");
        return Ok(());
    }
    let items: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&response.body.unwrap_or_default())
            .context("Cached listing is not valid JSON")?;

    if items.is_empty() {
        println!("Folder is empty.");
    } else {
        println!("Contents of {}:", folder);
        for name in items.keys() {
            if name.ends_with('/') {
                println!("  [DIR]  {}", name);
            } else {
                println!("  [FILE] {}", name);
            }
        }
    }
    Ok(())
}

/// Print or extract a document.
async fn cmd_get(cache: &LocalCache, path: &str, output: Option<&Path>) -> Result<()> {
    let document = parse_path(path)?;
    let response = cache.get_cached(&document).await?;
    anyhow::ensure!(response.status == Status::OK, "{} is not cached", path);
    let body = response.body.unwrap_or_default();

    match output {
        Some(file) => {
            tokio::fs::write(file, &body)
                .await
                .context("Failed to write output file")?;
            println!(
                "Document saved: {} ({} bytes, {})",
                file.display(),
                body.len(),
                response.content_type.as_deref().unwrap_or("unknown type")
            );
        }
        None => println!("{}", String::from_utf8_lossy(&body)),
    }
    Ok(())
}

/// Write a document from a file or inline data.
async fn cmd_put(
    cache: &LocalCache,
    path: &str,
    file: Option<&Path>,
    data: Option<String>,
    content_type: &str,
) -> Result<()> {
    let document = parse_path(path)?;
    let body = match (file, data) {
        (Some(file), _) => tokio::fs::read(file)
            .await
            .context("Failed to read source file")?,
        (None, Some(data)) => data.into_bytes(),
        (None, None) => anyhow::bail!("Pass --file or --data"),
    };
    let size = body.len();

    cache
        .put(&document, body, content_type)
        .await
        .context("Failed to write document")?;
    info!("Stored {} locally", document);
    println!("Document written: {} ({} bytes)", document, size);
    Ok(())
}

/// Delete a document.
async fn cmd_rm(cache: &LocalCache, path: &str) -> Result<()> {
    let document = parse_path(path)?;
    cache
        .delete(&document)
        .await
        .context("Failed to delete document")?;
    println!("Document deleted: {}", document);
    Ok(())
}

/// Drop cached data below a path.
async fn cmd_flush(cache: &LocalCache, path: &str) -> Result<()> {
    let root = parse_path(path)?;
    cache.flush(&root).await.context("Failed to flush cache")?;
    println!("Flushed {}", root);
    Ok(())
}

/// Show every node that is not in sync.
async fn cmd_pending(cache: &LocalCache) -> Result<()> {
    let mut pending: Vec<(NodePath, NodeStatus)> = Vec::new();
    cache
        .for_all_nodes(&mut |node: &Node| {
            let status = classify(node);
            if status != NodeStatus::Synced {
                pending.push((node.path.clone(), status));
            }
        })
        .await?;

    if pending.is_empty() {
        println!("Everything is in sync.");
    } else {
        for (path, status) in pending {
            println!("  {:<8} {}", status.as_str(), path);
        }
    }
    Ok(())
}

/// Print the raw node.
async fn cmd_dump(cache: &LocalCache, path: &str) -> Result<()> {
    let path = parse_path(path)?;
    let node = cache
        .store()
        .get_nodes(std::slice::from_ref(&path))
        .await?
        .remove(&path)
        .flatten();
    match node {
        Some(node) => println!("{}", serde_json::to_string_pretty(&node)?),
        None => println!("No cached node for {}", path),
    }
    Ok(())
}
