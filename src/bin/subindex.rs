#![forbid(unsafe_code)]

//! Command-line front end for the subtitle indexing pipeline.
//!
//! Thin by design: it resolves configuration, opens the store, and hands
//! everything to the library. Search and export tooling consume the same
//! database through the store's read-only API.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use subindex::config::{ConfigOverrides, RuntimeConfig, resolve_config};
use subindex::discovery::DiscoverySession;
use subindex::fetch::{FetchPolicy, YtDlpSource};
use subindex::pipeline::{IngestPipeline, IngestReport, PipelineOptions};
use subindex::security::ensure_unprivileged;
use subindex::store::SubtitleStore;

#[derive(Parser)]
#[command(
    name = "subindex",
    version,
    about = "Download and index video subtitles for full-text search"
)]
struct Cli {
    /// Path to the subtitle database.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Caption language to request.
    #[arg(short, long, global = true)]
    language: Option<String>,

    /// Number of parallel fetch workers.
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and index all subtitles for a channel or playlist.
    Download {
        /// Channel handle, channel id, playlist id, or youtube.com URL.
        reference: String,
    },
    /// Fetch whatever was published since the last run. With no id,
    /// every stored channel is refreshed.
    Update { channel_id: Option<String> },
    /// List indexed channels.
    List,
    /// Delete a channel and everything it owns.
    Delete { channel_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_unprivileged("subindex")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subindex=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(ConfigOverrides {
        db_path: cli.db,
        language: cli.language,
        jobs: cli.jobs,
        env_path: None,
    })?;

    let store = SubtitleStore::open(&config.db_path)
        .await
        .context("opening subtitle database")?;

    match cli.command {
        Commands::Download { reference } => {
            let pipeline = build_pipeline(store, &config).await?;
            print_banner(&config);
            println!("Reference: {reference}");
            println!();
            let report = pipeline.ingest(&reference).await?;
            print_report(&report);
        }
        Commands::Update {
            channel_id: Some(channel_id),
        } => {
            let pipeline = build_pipeline(store, &config).await?;
            print_banner(&config);
            let report = pipeline.update(&channel_id).await?;
            print_report(&report);
        }
        Commands::Update { channel_id: None } => {
            let pipeline = build_pipeline(store, &config).await?;
            print_banner(&config);
            println!("Updating every stored channel...");
            let reports = pipeline.update_all().await?;
            if reports.is_empty() {
                println!("No channels in the database yet.");
            }
            for (channel, report) in reports {
                println!();
                println!("{} ({})", channel.channel_name, channel.channel_id);
                print_report(&report);
            }
        }
        Commands::List => {
            let channels = store.list_channels().await?;
            if channels.is_empty() {
                println!("No channels indexed yet.");
            }
            for channel in channels {
                let videos = store.count_videos(&channel.channel_id).await?;
                println!(
                    "{}  {}  ({} videos)",
                    channel.channel_id, channel.channel_name, videos
                );
            }
        }
        Commands::Delete { channel_id } => {
            if store.delete_channel(&channel_id).await? {
                println!("Deleted channel {channel_id} with all of its videos and subtitles.");
            } else {
                println!("No channel with id {channel_id} in the database.");
            }
        }
    }

    Ok(())
}

/// Wires the production capabilities into a pipeline. The retrieval tool
/// is probed up front so a missing install fails before any network work.
async fn build_pipeline(store: SubtitleStore, config: &RuntimeConfig) -> Result<IngestPipeline> {
    let source = Arc::new(YtDlpSource::default());
    source.ensure_available().await?;
    Ok(IngestPipeline::new(
        store,
        DiscoverySession::new()?,
        Arc::clone(&source) as Arc<dyn subindex::fetch::CaptionSource>,
        source,
        PipelineOptions {
            language: config.language.clone(),
            jobs: config.jobs,
            policy: FetchPolicy::default(),
        },
    ))
}

fn print_banner(config: &RuntimeConfig) {
    println!("===================================");
    println!("Subtitle Indexer");
    println!("===================================");
    println!("Database: {}", config.db_path.display());
    println!("Language: {}  Jobs: {}", config.language, config.jobs);
    println!();
}

fn print_report(report: &IngestReport) {
    println!();
    println!("Batch complete for channel {}", report.channel_id);
    println!("  fetched: {}", report.fetched);
    println!("  skipped: {}", report.skipped);
    println!("  failed:  {}", report.failed);
    if report.failed > 0 {
        println!("Re-running the same command will retry the failed videos.");
    }
}
