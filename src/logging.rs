//! Tracing setup for the `rdl` binary.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogFormat;

/// Initialize the global subscriber.
///
/// `verbosity` maps 0=warn, 1=info, 2=debug, 3+=trace; `RUST_LOG` wins when set.
/// Logs go to stderr unless `log_file` is given, so they do not fight with
/// progress bars or the JSON event stream on stdout.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("resumedl={level},rdl={level}")));

    let registry = tracing_subscriber::registry().with(filter);

    match (log_file, format) {
        (None, LogFormat::Text) => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        (None, LogFormat::Json) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            let writer = Mutex::new(file);
            match format {
                LogFormat::Text => registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .try_init(),
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_writer(writer))
                    .try_init(),
            }
        }
    }
    .context("Failed to install tracing subscriber")
}
