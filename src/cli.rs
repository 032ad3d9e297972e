//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Resumable bulk media downloader for extractor output.
///
/// Reads one JSON media item per line from `--input` (or stdin), downloads
/// each into its folder under the download root, and records the result in
/// the history database so later runs skip finished files.
#[derive(Parser, Debug)]
#[command(name = "mediafetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// TOML configuration file
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// JSON lines file with media items ("-" or omitted reads stdin)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Override `download_root`
    #[arg(short = 'o', long)]
    pub download_root: Option<PathBuf>,

    /// Override `max_workers_per_host` (1-100)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub workers: Option<u16>,

    /// Override `max_workers_global` (1-100)
    #[arg(short = 'g', long, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub global_workers: Option<u16>,

    /// Override `attempts` per item (1-100)
    #[arg(short = 'a', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub attempts: Option<u32>,

    /// Retry retriable failures without limit
    #[arg(long)]
    pub no_attempt_limit: bool,

    /// Print incomplete history rows as JSON lines and exit
    #[arg(long)]
    pub retry_failed: bool,
}
