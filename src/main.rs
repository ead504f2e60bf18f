//! Transform Cache CLI
//!
//! Runs the transformation cache engine against a local storage root:
//! process images through the pipeline, derive cache keys without
//! processing, and audit a cache directory against its metadata.

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use transform_cache::cache::KeyFlags;
use transform_cache::{
    EngineConfig, JsonMetadataStore, LocalFileStorage, ParameterSet, PassthroughEngine, Pipeline,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Transform Cache - caches the results of image transformations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long, env = "TRANSFORM_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding one subdirectory per storage connection
    #[arg(long, env = "STORAGE_ROOT", default_value = "./storage")]
    storage_root: PathBuf,

    /// Metadata store file; defaults to metadata.json under the storage root
    #[arg(long, env = "METADATA_PATH")]
    metadata: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process one image and print the result
    Process(ProcessArgs),
    /// Print the cache key a request would use
    Key(ProcessArgs),
    /// Reconcile a cache directory with its metadata
    Audit {
        /// Connection to audit; defaults to the configured connection
        #[arg(long)]
        connection: Option<String>,

        /// Directory to audit; defaults to the configured cache directory
        #[arg(long)]
        location: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct ProcessArgs {
    /// Source locator within the source connection
    source: String,

    /// Request parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    info!("Starting Transform Cache");
    info!("  Version: {}", transform_cache::VERSION);
    info!("  Storage root: {}", args.storage_root.display());
    info!("  Tenant: {}", config.tenant);

    match &args.command {
        Command::Key(request) => print_key(&config, request),
        Command::Process(request) => {
            let pipeline = build_pipeline(&args, config).await?;
            let params = ParameterSet::parse_pairs(&request.params).context("parsing parameters")?;
            let result = pipeline.process(&request.source, params).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            let metrics = pipeline.metrics();
            info!(
                hits = metrics.hits,
                misses = metrics.misses,
                writes_flushed = metrics.writes_flushed,
                "request complete"
            );
            if !result.success {
                anyhow::bail!("processing failed: {}", result.errors.join("; "));
            }
            Ok(())
        }
        Command::Audit { connection, location } => {
            let connection = connection.clone().unwrap_or_else(|| config.connection.clone());
            let location = location.clone().unwrap_or_else(|| config.cache_dir.clone());
            let pipeline = build_pipeline(&args, config).await?;

            let result = pipeline
                .audit_engine()
                .audit_location(&connection, &location)
                .await
                .with_context(|| format!("auditing {}:{}", connection, location))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.errors > 0 {
                warn!(errors = result.errors, "audit finished with errors");
            }
            Ok(())
        }
    }
}

async fn build_pipeline(args: &Args, config: EngineConfig) -> anyhow::Result<Pipeline> {
    let metadata_path = args
        .metadata
        .clone()
        .unwrap_or_else(|| args.storage_root.join("metadata.json"));
    let store = JsonMetadataStore::open(&metadata_path)
        .await
        .with_context(|| format!("opening metadata store {}", metadata_path.display()))?;
    let files = LocalFileStorage::new(&args.storage_root);

    let pipeline = Pipeline::new(
        config,
        Arc::new(store),
        Arc::new(files),
        Arc::new(PassthroughEngine::new()),
    )
    .context("building pipeline")?;
    Ok(pipeline)
}

fn print_key(config: &EngineConfig, request: &ProcessArgs) -> anyhow::Result<()> {
    config.validate()?;
    let params = ParameterSet::parse_pairs(&request.params).context("parsing parameters")?;
    let classifier = Arc::new(transform_cache::TransformationalParameterFilter::new(
        config.transformational_parameters.iter().cloned(),
    ));
    let deriver = transform_cache::KeyDeriver::new(classifier);
    let flags = KeyFlags::for_request(config, &params, false);
    let key = deriver.derive(&request.source, &params, &flags);

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "key": key.to_string(),
            "identity": key.identity(),
            "duration": key.duration(),
            "transform_hash": key.transform_hash(),
        }))?
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
