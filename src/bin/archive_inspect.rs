//! Archive Inspect
//!
//! Command-line view of an archive cache on disk

use anyhow::{bail, Context};
use archive_cache::{
    ArchiveCache, ArtifactRequest, CacheConfig, DataKind, LocalStorage, ObjectId,
    ResolvedArtifact, CHUNK_TYPE_LOG, CHUNK_TYPE_METRICS,
};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "archive-inspect")]
#[command(about = "Inspect the contents of an archive cache")]
struct Args {
    /// Path to the archive data file (side files are found next to it)
    #[arg(short = 'a', long)]
    archive: PathBuf,

    /// Optional TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print space usage as JSON
    Metrics {
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Resolve one artifact of an object and write it to stdout
    Resolve {
        /// Object id (hex)
        #[arg(value_parser = parse_hex)]
        object: ObjectId,

        /// Chunk type code (hex), or "metrics" / "log"
        #[arg(short = 't', long = "type")]
        chunk_type: String,

        /// Expected artifact version
        #[arg(short = 'v', long)]
        version: Option<u32>,
    },

    /// Print the state and dependencies of an object
    Status {
        /// Object id (hex)
        #[arg(value_parser = parse_hex)]
        object: ObjectId,
    },
}

/// Parse a hex value with or without a `0x` prefix
fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex value '{}': {}", s, e))
}

fn parse_chunk_type(s: &str) -> Result<u64, String> {
    match s.to_lowercase().as_str() {
        "metrics" => Ok(CHUNK_TYPE_METRICS),
        "log" => Ok(CHUNK_TYPE_LOG),
        _ => parse_hex(s),
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if !args.archive.exists() {
        bail!("Archive {} does not exist", args.archive.display());
    }

    info!("Archive path: {:?}", args.archive);

    // Inspection never creates files
    let storage = Arc::new(LocalStorage::new().with_create_directories(false));
    let cache = Arc::new(ArchiveCache::new(
        Some(storage),
        &args.archive,
        config.create_directories(false),
    ));

    match args.command {
        Command::Metrics { pretty } => {
            let metrics = cache.metrics();
            let json = if pretty {
                serde_json::to_string_pretty(&metrics)?
            } else {
                serde_json::to_string(&metrics)?
            };
            println!("{}", json);
        }
        Command::Resolve {
            object,
            chunk_type,
            version,
        } => {
            let type_code = parse_chunk_type(&chunk_type).map_err(anyhow::Error::msg)?;
            let collection = cache
                .try_open_from_cache(object)
                .with_context(|| format!("object {:x} is missing or out of date", object))?;

            let mut request = ArtifactRequest::new(chunk_type.clone(), type_code).kind(DataKind::Raw);
            if let Some(version) = version {
                request = request.version(version);
            }

            let resolved = collection.resolve_requests(&[request])?;
            let mut stdout = io::stdout().lock();
            if let Some(bytes) = resolved.first().and_then(ResolvedArtifact::bytes) {
                stdout.write_all(bytes)?;
            }
            stdout.flush()?;
        }
        Command::Status { object } => {
            let collection = match cache.try_open_from_cache(object) {
                Some(collection) => collection,
                None => {
                    println!("{:x}: missing or out of date", object);
                    return Ok(());
                }
            };

            let state = collection.asset_state()?;
            let deps = collection.dependency_validation()?;
            println!("{:x}: {:?}", object, state);
            for file in deps.files() {
                println!("  {} {:?}", file.filename, file.snapshot);
            }
        }
    }

    Ok(())
}
