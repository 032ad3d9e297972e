//! CLI entry point for mediafetch.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mediafetch_core::{
    DownloadEngine, DownloadStats, EngineConfig, FanoutObserver, HistoryStore, MediaItem,
    ProgressObserver,
};
use tracing::{debug, info, warn};

mod app;
mod cli;

use app::progress_bar::ProgressBarObserver;
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;

    if args.retry_failed {
        return print_failed_items(&config).await;
    }

    let items = read_items(&args, &config)?;
    if items.is_empty() {
        info!("No media items in input");
        info!("Example: echo '{{\"source_url\": \"https://example.com/a.jpg\"}}' | mediafetch");
        return Ok(());
    }
    info!(items = items.len(), root = %config.download_root.display(), "mediafetch starting");

    let stats = Arc::new(DownloadStats::new());
    let progress = (!args.quiet && io::stderr().is_terminal())
        .then(|| Arc::new(ProgressBarObserver::new(items.len() as u64)));
    let mut observers: Vec<Arc<dyn ProgressObserver>> = vec![stats.clone() as Arc<dyn ProgressObserver>];
    if let Some(progress) = &progress {
        observers.push(progress.clone());
    }

    let engine = DownloadEngine::builder(config)
        .observer(Arc::new(FanoutObserver::new(observers)))
        .build()
        .await
        .context("failed to start download engine")?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping downloads (partial files are kept)");
            cancel.cancel();
        }
    });

    for item in items {
        engine.submit(item).await?;
    }
    let outcome = engine.wait_all().await;
    engine.shutdown().await;
    if let Some(progress) = &progress {
        progress.finish();
    }

    info!(
        completed = stats.completed(),
        skipped = stats.skipped(),
        previously_downloaded = stats.previously_downloaded(),
        failed = stats.failed(),
        retried = stats.retried(),
        bytes = stats.bytes(),
        "Download complete"
    );
    outcome.context("download run aborted")?;
    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.download_root {
        config.download_root.clone_from(root);
    }
    if let Some(workers) = args.workers {
        config.max_workers_per_host = usize::from(workers);
    }
    if let Some(workers) = args.global_workers {
        config.max_workers_global = usize::from(workers);
    }
    if let Some(attempts) = args.attempts {
        config.attempts = attempts;
    }
    if args.no_attempt_limit {
        config.disable_attempt_limit = true;
    }
    config.validate()?;
    Ok(config)
}

fn read_items(args: &Args, config: &EngineConfig) -> Result<Vec<MediaItem>> {
    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) if path.as_os_str() != "-" => Box::new(io::BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("cannot open input {}", path.display()))?,
        )),
        _ if io::stdin().is_terminal() => return Ok(Vec::new()),
        _ => Box::new(io::stdin().lock()),
    };

    let mut items = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match MediaItem::from_json_line(line, config) {
            Ok(item) => items.push(item),
            Err(error) => warn!(line = index + 1, %error, "Skipped invalid media item"),
        }
    }
    Ok(items)
}

async fn print_failed_items(config: &EngineConfig) -> Result<()> {
    let store = HistoryStore::open_without_preallocation(&config.history_db_path()).await?;
    let failed = store.get_failed_items().await?;
    store.close().await;

    let mut stdout = io::stdout().lock();
    for item in &failed {
        writeln!(stdout, "{}", serde_json::to_string(item)?)?;
    }
    info!(count = failed.len(), "listed incomplete items");
    Ok(())
}
