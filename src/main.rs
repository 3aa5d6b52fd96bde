mod cli;
mod commands;
mod config;
mod engine;
mod error;
mod logging;
mod network;
mod state;
mod store;
mod utils;
mod worker;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{EventMode, LogFormat};
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URLs to download
    #[arg(index = 1)]
    urls: Vec<String>,

    /// Path to a file containing URLs (one per line, `#` starts a comment)
    #[arg(short = 't', long = "tasks-file")]
    tasks_file: Option<PathBuf>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Directory holding progress records [default: <download-dir>/.progress]
    #[arg(long = "progress-dir")]
    progress_dir: Option<PathBuf>,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Do not pick up paused or failed downloads found in the progress directory
    #[arg(long)]
    no_reattach: bool,

    /// fsync data and progress records at every checkpoint
    #[arg(long)]
    sync: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// List unfinished downloads and their status
    #[arg(short = 'l', long)]
    list: bool,

    /// How transfer events are reported
    #[arg(long, value_enum, default_value = "bars")]
    events: EventMode,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(path);
        }
    }
    path
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose, args.log_file.as_deref(), args.log_format)?;

    // Directories might not exist yet, so resolve them against the current dir
    let mut config = Config::new(absolute(args.download_dir))
        .with_sync_writes(args.sync)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));
    if let Some(dir) = args.progress_dir {
        config = config.with_progress_dir(absolute(dir));
    }

    let rt = tokio::runtime::Runtime::new()?;
    if args.list {
        return rt.block_on(crate::commands::list_downloads(&config));
    }

    let mut urls = args.urls;
    let tasks_file = args.tasks_file;
    let options = crate::commands::RunOptions {
        concurrency: args.concurrency.unwrap_or_else(num_cpus::get),
        reattach: !args.no_reattach,
        events: args.events,
    };
    rt.block_on(async {
        if let Some(path) = tasks_file {
            urls.extend(crate::commands::read_tasks_file(&path).await?);
        }
        crate::commands::run_downloads(urls, config, options).await
    })
}
