//! CLI entry point for the train tracker.
//!
//! Provides subcommands for polling a position feed on an interval, consuming
//! a live NDJSON stream from stdin, and normalizing a single batch file.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use train_tracker::{
    clock::{Clock, SystemClock},
    config::TrackerConfig,
    fetch::{
        BasicClient, HttpClient,
        auth::{ApiKey, UrlParam},
        source_for,
    },
    output::{LogSink, SnapshotSink, StatsCsvSink},
    parser::parse_batch,
    registry::Registry,
    scheduler::{Poller, Streamer},
};

#[derive(Parser)]
#[command(name = "train_tracker")]
#[command(about = "Normalizes live train positions and estimates missing speeds", long_about = None)]
struct Cli {
    /// JSON file overriding the default tuning constants
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a position feed from a file or URL
    Poll {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Seconds between cycles
        #[arg(short, long, default_value_t = 10)]
        interval: u64,

        /// Number of cycles to run (0 = until interrupted)
        #[arg(short = 'n', long, default_value_t = 0)]
        cycles: usize,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Optional: JSON file rewritten with all current trains after each cycle
        #[arg(long)]
        snapshot: Option<String>,

        /// Optional: CSV file to append cycle statistics to
        #[arg(long)]
        stats: Option<String>,

        /// API key for the feed (falls back to TRAIN_FEED_API_KEY)
        #[arg(long)]
        api_key: Option<String>,

        /// Header carrying the API key
        #[arg(long, default_value = "Authorization")]
        api_key_header: String,

        /// Send the API key as this query parameter instead of a header
        #[arg(long)]
        api_key_param: Option<String>,
    },
    /// Consume NDJSON observations from stdin, evicting trains that go quiet
    Stream {
        /// Seconds without a report before a train is dropped
        #[arg(long)]
        stale_after: Option<f64>,

        /// Seconds between staleness sweeps
        #[arg(long, default_value_t = 30)]
        sweep_every: u64,

        /// Optional: JSON file rewritten with all current trains after each sweep
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Normalize a single batch file and print the records as JSON
    Normalize {
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/train_tracker.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("train_tracker.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };

    match cli.command {
        Commands::Poll {
            source,
            interval,
            cycles,
            timeout,
            snapshot,
            stats,
            api_key,
            api_key_header,
            api_key_param,
        } => {
            let api_key = api_key.or_else(|| std::env::var("TRAIN_FEED_API_KEY").ok());
            let client = build_client(
                Duration::from_secs(timeout),
                api_key.as_deref(),
                &api_key_header,
                api_key_param.as_deref(),
            )?;
            let mut poller = Poller::new(
                source_for(&source, client),
                Registry::new(&config),
                Arc::new(SystemClock),
                Duration::from_secs(interval.max(1)),
            )
            .with_sink(Box::new(LogSink));
            if let Some(path) = snapshot {
                poller = poller.with_sink(Box::new(SnapshotSink::new(path)));
            }
            if let Some(path) = stats {
                poller = poller.with_sink(Box::new(StatsCsvSink::new(&path)));
            }

            poll(&mut poller, cycles).await?;
        }
        Commands::Stream {
            stale_after,
            sweep_every,
            snapshot,
        } => {
            let mut config = config;
            if let Some(secs) = stale_after {
                config.registry.stale_after_secs = secs;
            }

            let mut streamer = Streamer::new(
                Registry::new(&config),
                Arc::new(SystemClock),
                Duration::from_secs(sweep_every.max(1)),
            )
            .with_sink(Box::new(LogSink));
            if let Some(path) = snapshot {
                streamer = streamer.with_sink(Box::new(SnapshotSink::new(path)));
            }

            stream(&mut streamer).await?;
        }
        Commands::Normalize { file } => {
            normalize(&config, &file).await?;
        }
    }

    Ok(())
}

/// Wraps the base HTTP client with whichever credential the feed needs.
fn build_client(
    timeout: Duration,
    api_key: Option<&str>,
    header: &str,
    param: Option<&str>,
) -> Result<Box<dyn HttpClient>> {
    let base = BasicClient::new(timeout)?;
    let client: Box<dyn HttpClient> = match (api_key, param) {
        (None, Some(_)) => bail!("--api-key-param requires --api-key"),
        (None, None) => Box::new(base),
        (Some(key), Some(param)) => Box::new(UrlParam::new(base, param, key)),
        (Some(key), None) if header.eq_ignore_ascii_case("authorization") => {
            Box::new(ApiKey::bearer(base, key)?)
        }
        (Some(key), None) => Box::new(ApiKey::new(base, header, key)?),
    };
    Ok(client)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tracing::instrument(skip(poller))]
async fn poll(poller: &mut Poller, cycles: usize) -> Result<()> {
    if cycles == 0 {
        info!("Polling until interrupted. Press Ctrl+C to stop.");
    } else {
        info!(cycles, "Starting polling");
    }
    poller.run(cycles, shutdown_signal()).await
}

#[tracing::instrument(skip(streamer))]
async fn stream(streamer: &mut Streamer) -> Result<()> {
    info!("Reading observations from stdin");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    streamer.run(stdin, shutdown_signal()).await
}

/// Normalizes one batch as a first cycle and prints every record.
#[tracing::instrument(skip(config), fields(file = %file))]
async fn normalize(config: &TrackerConfig, file: &str) -> Result<()> {
    let bytes = tokio::fs::read(file).await?;
    let observations = parse_batch(&bytes)?;

    let mut registry = Registry::new(config);
    let (_, stats) = registry.apply_batch_with_stats(&observations, SystemClock.now());
    info!(
        trains = stats.trains,
        malformed = stats.malformed,
        duplicates = stats.duplicates,
        "batch normalized"
    );

    println!("{}", serde_json::to_string_pretty(&registry.records())?);
    Ok(())
}
