use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cli::EventMode;
use crate::config::Config;
use crate::engine::Notification;
use crate::network::HttpFetcher;
use crate::state::Transfer;
use crate::store::{ProgressStore, StoredRecord};
use crate::utils::transfer_id;
use crate::worker::{TransferHandle, TransferWorker, WorkerOutcome};

type Registry = Arc<Mutex<HashMap<String, TransferHandle>>>;

pub struct RunOptions {
    pub concurrency: usize,
    pub reattach: bool,
    pub events: EventMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    id: String,
    url: String,
}

pub async fn read_tasks_file(input: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(input)
        .await
        .context(format!("Failed to open tasks file: {:?}", input))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut urls = vec![];
    while let Some(line) = lines.next_line().await? {
        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        urls.push(raw.to_string());
    }
    Ok(urls)
}

/// Merge re-attached records with requested URLs, one target per id.
fn plan_targets(resumable: Vec<StoredRecord>, urls: Vec<String>) -> Vec<Target> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut targets = vec![];

    let candidates = resumable
        .into_iter()
        .map(|r| Ok((r.id, r.record.url)))
        .chain(urls.into_iter().map(|url| transfer_id(&url).map(|id| (id, url))));

    for candidate in candidates {
        let (id, url) = match candidate {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("Skipping: {}", e);
                continue;
            }
        };
        if let Some(existing) = seen.get(&id) {
            if existing != &url {
                eprintln!("Skipping {}: {} is already used by {}", url, id, existing);
            }
            continue;
        }
        seen.insert(id.clone(), url.clone());
        targets.push(Target { id, url });
    }
    targets
}

pub async fn run_downloads(urls: Vec<String>, config: Config, options: RunOptions) -> Result<()> {
    if !config.download_dir.exists() {
        fs::create_dir_all(&config.download_dir)
            .await
            .context("Failed to create download directory")?;
    }

    let store = ProgressStore::new(&config.progress_dir);
    let resumable = if options.reattach {
        store
            .list_resumable()
            .await
            .context("Failed to scan progress records")?
    } else {
        vec![]
    };
    if !resumable.is_empty() {
        tracing::info!(count = resumable.len(), "Re-attaching unfinished transfers");
    }

    let targets = plan_targets(resumable, urls);
    if targets.is_empty() {
        println!("Nothing to download.");
        return Ok(());
    }

    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let reporter = Reporter::new(options.events);
    let registry: Registry = Arc::default();
    let shutdown = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));

    let control_task = tokio::spawn(read_control(registry.clone(), shutdown.clone()));

    let mut drivers = vec![];
    for target in targets {
        drivers.push(tokio::spawn(drive(
            target,
            config.clone(),
            fetcher.clone(),
            semaphore.clone(),
            registry.clone(),
            shutdown.clone(),
            reporter.clone(),
        )));
    }

    let interrupt_task = tokio::spawn({
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, saving progress...");
                shutdown.cancel();
                shutdown_all(&registry).await;
            }
        }
    });

    let results = futures::future::join_all(drivers).await;
    interrupt_task.abort();
    control_task.abort();

    let mut summary = Summary::default();
    for result in results {
        match result {
            Ok(Some(outcome)) => summary.count(outcome),
            Ok(None) => summary.not_started += 1,
            Err(e) => {
                tracing::error!(error = %e, "Transfer driver panicked");
                summary.failed += 1;
            }
        }
    }
    summary.print();

    if summary.failed > 0 {
        bail!("{} transfer(s) failed; run again to resume them", summary.failed);
    }
    Ok(())
}

async fn drive(
    target: Target,
    config: Config,
    fetcher: Arc<HttpFetcher>,
    semaphore: Arc<Semaphore>,
    registry: Registry,
    shutdown: CancellationToken,
    reporter: Reporter,
) -> Option<WorkerOutcome> {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.ok()?,
        _ = shutdown.cancelled() => return None,
    };
    if shutdown.is_cancelled() {
        return None;
    }

    let transfer = Transfer::new(&target.id, &target.url, config.destination_for(&target.id));
    let worker = TransferWorker::new(transfer, &config, fetcher);
    let notes = worker.subscribe();
    let handle = worker.spawn();
    registry.lock().await.insert(target.id.clone(), handle.clone());
    if shutdown.is_cancelled() {
        handle.shutdown().await;
    }

    let report = tokio::spawn(reporter.follow(target.id.clone(), notes));
    let outcome = handle.join().await;
    registry.lock().await.remove(&target.id);
    let _ = report.await;
    Some(outcome)
}

async fn shutdown_all(registry: &Registry) {
    let handles: Vec<TransferHandle> = registry.lock().await.values().cloned().collect();
    futures::future::join_all(handles.iter().map(|h| h.shutdown())).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    All,
    One(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Apply(Action, Selector),
    Quit,
}

/// `pause <id|all>`, `resume <id|all>`, `cancel <id|all>` or `quit`.
fn parse_control(line: &str) -> Result<Option<ControlCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let action = match verb {
        "quit" | "q" => return Ok(Some(ControlCommand::Quit)),
        "pause" | "p" => Action::Pause,
        "resume" | "r" => Action::Resume,
        "cancel" | "c" => Action::Cancel,
        other => return Err(format!("Unknown command {:?} (pause, resume, cancel, quit)", other)),
    };
    let selector = match words.next() {
        None | Some("all") => Selector::All,
        Some(id) => Selector::One(id.to_string()),
    };
    Ok(Some(ControlCommand::Apply(action, selector)))
}

/// Read control commands from stdin.
///
/// Stdin is read on a plain thread; a blocking read must not hold up runtime shutdown.
async fn read_control(registry: Registry, shutdown: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<String>(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = rx.recv().await {
        match parse_control(&line) {
            Ok(None) => {}
            Ok(Some(ControlCommand::Quit)) => {
                shutdown.cancel();
                shutdown_all(&registry).await;
                return;
            }
            Ok(Some(ControlCommand::Apply(action, selector))) => apply(&registry, action, &selector).await,
            Err(e) => eprintln!("{}", e),
        }
    }
}

async fn apply(registry: &Registry, action: Action, selector: &Selector) {
    let handles: Vec<TransferHandle> = {
        let registry = registry.lock().await;
        match selector {
            Selector::All => registry.values().cloned().collect(),
            Selector::One(id) => registry.get(id).cloned().into_iter().collect(),
        }
    };
    if let (Selector::One(id), true) = (selector, handles.is_empty()) {
        eprintln!("No active transfer {:?}", id);
        return;
    }

    for handle in handles {
        let result = match action {
            Action::Pause => handle.pause().await,
            Action::Resume => handle.resume().await,
            Action::Cancel => handle.cancel().await,
        };
        if let Err(e) = result {
            tracing::warn!(id = handle.id(), ?action, error = %e, "Control request failed");
        }
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    id: &'a str,
    #[serde(flatten)]
    notification: &'a Notification,
}

#[derive(Clone)]
struct Reporter {
    mode: EventMode,
    multi_progress: MultiProgress,
}

impl Reporter {
    fn new(mode: EventMode) -> Self {
        let multi_progress = MultiProgress::new();
        let target = match mode {
            // Redraw at 5Hz so output stays readable when redirected to a file.
            EventMode::Bars => ProgressDrawTarget::stderr_with_hz(5),
            EventMode::Json => ProgressDrawTarget::hidden(),
        };
        multi_progress.set_draw_target(target);
        Self { mode, multi_progress }
    }

    async fn follow(self, id: String, mut notes: mpsc::UnboundedReceiver<Notification>) {
        match self.mode {
            EventMode::Json => {
                while let Some(notification) = notes.recv().await {
                    let line = EventLine {
                        id: &id,
                        notification: &notification,
                    };
                    match serde_json::to_string(&line) {
                        Ok(json) => println!("{}", json),
                        Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
                    }
                }
            }
            EventMode::Bars => self.follow_bar(&id, notes).await,
        }
    }

    async fn follow_bar(&self, id: &str, mut notes: mpsc::UnboundedReceiver<Notification>) {
        let pb = self.multi_progress.add(ProgressBar::new(0));
        pb.set_style(spinner_style());
        pb.set_message(format!("Downloading {}", id));

        let mut known_total = None;
        let mut finished = false;
        while let Some(notification) = notes.recv().await {
            match notification {
                Notification::Progress { downloaded, total } => {
                    if total.is_some() && total != known_total {
                        known_total = total;
                        pb.set_length(total.unwrap_or_default());
                        pb.set_style(bar_style());
                    }
                    pb.set_position(downloaded);
                }
                Notification::PauseStateChanged { paused } => {
                    let state = if paused { "Paused     " } else { "Downloading" };
                    pb.set_message(format!("{} {}", state, id));
                }
                Notification::Completed { path } => {
                    pb.finish_with_message(format!("Completed   {}", path.display()));
                    finished = true;
                }
                Notification::Failed { cause } => {
                    pb.abandon_with_message(format!("Failed      {}: {}", id, cause));
                    finished = true;
                }
            }
        }
        if !finished {
            pb.abandon_with_message(format!("Stopped     {}", id));
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// No total known: show bytes and rate, never a percentage.
fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {bytes:>12} {bytes_per_sec:>12} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    failed: usize,
    cancelled: usize,
    not_started: usize,
}

impl Summary {
    fn count(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Completed => self.completed += 1,
            WorkerOutcome::Failed => self.failed += 1,
            WorkerOutcome::Cancelled => self.cancelled += 1,
        }
    }

    fn print(&self) {
        eprintln!(
            "Summary: Completed: {} | Failed: {} | Stopped: {} | Not started: {}",
            self.completed, self.failed, self.cancelled, self.not_started
        );
    }
}

pub async fn list_downloads(config: &Config) -> Result<()> {
    let store = ProgressStore::new(&config.progress_dir);
    let records = store.scan().await.context("Failed to read progress records")?;

    if records.is_empty() {
        println!("No unfinished downloads in {:?}.", config.progress_dir);
        return Ok(());
    }

    let downloaded: u64 = records.iter().map(|r| r.record.downloaded).sum();
    let known: u64 = records.iter().map(|r| r.record.total).sum();
    println!(
        "Summary: Unfinished: {} | Downloaded: {} / {}",
        records.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    println!(
        "{:<40} {:<12} {:<10} {:<12} {:<12} {:<16}",
        "Filename", "Status", "Progress", "Downloaded", "Size", "Updated"
    );
    println!("{:-<40} {:-<12} {:-<10} {:-<12} {:-<12} {:-<16}", "", "", "", "", "", "");

    for stored in &records {
        let record = &stored.record;
        let progress = record
            .percent()
            .map(|p| format!("{:.2}%", p))
            .unwrap_or_else(|| "unknown".to_string());
        let size = record
            .total()
            .map(|t| HumanBytes(t).to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let updated = fs::metadata(&stored.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        println!(
            "{:<40} {:<12} {:<10} {:<12} {:<12} {:<16}",
            stored.id,
            record.status.to_string(),
            progress,
            HumanBytes(record.downloaded).to_string(),
            size,
            updated
        );
    }

    Ok(())
}
