//! tickload - market data ingestion tool

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tickload_common::logging::{init_logging_with_layers, LogConfig, LogLevel};
use tickload_common::ShardKey;
use tickload_ingest::config::{DuplicatePolicy, EngineBackend, IngestConfig};
use tickload_ingest::log_aggregator::LogAggregator;
use tickload_ingest::orchestrator::{RunSummary, WorkerOrchestrator};
use tickload_ingest::FileCatalog;
use tracing::info;
use tracing_subscriber::Layer;

#[derive(Parser, Debug)]
#[command(name = "tickload")]
#[command(author, version, about = "Loads exchange extracts into a partitioned tick database")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "TICKLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every configured shard
    Run {
        /// First month to ingest (YYYYMM)
        #[arg(long)]
        from: Option<ShardKey>,

        /// Last month to ingest (YYYYMM)
        #[arg(long)]
        to: Option<ShardKey>,

        /// Source directory under the source root; repeat for several
        #[arg(short, long = "dir")]
        dirs: Vec<String>,

        /// Engine backend (q or local)
        #[arg(long)]
        engine: Option<EngineBackend>,

        /// How files that were already ingested are treated
        #[arg(long)]
        duplicates: Option<DuplicatePolicy>,

        /// Upper bound on concurrently running shards
        #[arg(short = 'j', long)]
        parallel: Option<usize>,
    },

    /// List the files each shard would ingest
    Discover {
        /// Only this month (YYYYMM)
        #[arg(long)]
        shard: Option<ShardKey>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // environment variables take precedence over the flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tickload")
        .build()
        .merge_env()?;

    let mut config = IngestConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            from,
            to,
            dirs,
            engine,
            duplicates,
            parallel,
        } => {
            if let Some(from) = from {
                config.first_shard = from;
            }
            if let Some(to) = to {
                config.last_shard = to;
            }
            if !dirs.is_empty() {
                config.source_dirs = dirs;
            }
            if let Some(engine) = engine {
                config.engine.backend = engine;
            }
            if let Some(duplicates) = duplicates {
                config.duplicate_policy = duplicates;
            }
            if let Some(parallel) = parallel {
                config.max_parallel_shards = parallel;
            }
            config.validate()?;

            run(config, &log_config).await
        },
        Command::Discover { shard } => {
            let _guard = init_logging_with_layers(&log_config, Vec::new())?;
            discover(&config, shard)
        },
    }
}

async fn run(config: IngestConfig, log_config: &LogConfig) -> Result<()> {
    let sink: Box<dyn Write + Send> = match &config.aggregate_log {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create shard log {}", path.display()))?;
            Box::new(BufWriter::new(file))
        },
        None => Box::new(io::stderr()),
    };

    let (aggregator, layer) = LogAggregator::start(config.log_channel_capacity, sink);
    let _guard = init_logging_with_layers(log_config, vec![layer.boxed()])?;

    let summary = WorkerOrchestrator::new(config).run().await;

    let (stats, _sink) = aggregator.finish().await.context("Shard log writer failed")?;
    if stats.dropped > 0 {
        eprintln!("warning: {} shard log records were dropped", stats.dropped);
    }

    print_summary(&summary);

    if !summary.is_success() {
        anyhow::bail!(
            "{} shard(s) and {} source director(ies) failed",
            summary.failed_shards().count(),
            summary.directory_errors.len()
        );
    }

    info!("Ingestion complete");
    Ok(())
}

fn discover(config: &IngestConfig, only: Option<ShardKey>) -> Result<()> {
    let catalog = FileCatalog::new();
    let shards = match only {
        Some(shard) => vec![shard],
        None => config.shards(),
    };

    for name in &config.source_dirs {
        let dir = config.source_dir(name);
        for &shard in &shards {
            for kind in config.ordered_kinds() {
                let files = catalog
                    .discover(&dir, shard, kind)
                    .with_context(|| format!("Discovery failed in {}", dir.display()))?;
                for file in files {
                    println!("{}\t{}\t{}\t{}", name, shard, kind, file.path.display());
                }
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Ingested {} files ({} rows), skipped {}, failed {}",
        summary.files_ingested(),
        summary.rows_appended(),
        summary.files_skipped(),
        summary.files_failed()
    );

    for error in &summary.directory_errors {
        println!("  directory: {error}");
    }

    for shard in summary.failed_shards() {
        let reason = shard
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{} file(s) failed", shard.files_failed()));
        println!("  {} ({}): {}", shard.shard, shard.source_dir.display(), reason);
    }

    let warnings: usize = summary
        .shards
        .iter()
        .map(|s| s.cleanup_warnings().count())
        .sum();
    if warnings > 0 {
        println!("  {warnings} artifact(s) could not be removed");
    }
}
