//! One task per transfer.
//!
//! The worker task owns its [`TransferEngine`] outright. Control requests from
//! the [`TransferHandle`] and events from the network arrive on channels and
//! are applied one at a time; notifications are relayed to subscribers in the
//! order the engine produced them.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::Config;
use crate::engine::{Notification, TransferEngine};
use crate::error::Result;
use crate::network::{NetworkEvent, RangeFetcher};
use crate::state::{Transfer, TransferStatus};
use crate::store::ProgressStore;

const CONTROL_BUFFER: usize = 16;

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>;
type Ack = oneshot::Sender<Result<()>>;

enum Control {
    Pause(Ack),
    Resume(Ack),
    Cancel(Ack),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
}

pub struct TransferWorker<F: RangeFetcher> {
    transfer: Transfer,
    config: Config,
    fetcher: Arc<F>,
    subscribers: Subscribers,
}

impl<F: RangeFetcher> TransferWorker<F> {
    pub fn new(transfer: Transfer, config: &Config, fetcher: Arc<F>) -> Self {
        Self {
            transfer,
            config: config.clone(),
            fetcher,
            subscribers: Arc::default(),
        }
    }

    /// Subscribe before spawning to see every notification, including the first.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        subscribe(&self.subscribers)
    }

    /// Start the engine on its own task.
    pub fn spawn(self) -> TransferHandle {
        let id = self.transfer.id.clone();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let store = ProgressStore::new(&self.config.progress_dir).with_sync(self.config.sync_writes);
        let engine = TransferEngine::new(self.transfer, store, self.fetcher, event_tx, notify_tx)
            .with_sync_writes(self.config.sync_writes);

        let relay = Relay {
            pending: notify_rx,
            subscribers: self.subscribers.clone(),
        };
        let span = tracing::info_span!("transfer", id = %id);
        let task = tokio::spawn(run(engine, control_rx, event_rx, relay).instrument(span));

        TransferHandle {
            id,
            control: control_tx,
            subscribers: self.subscribers,
            task: Arc::new(tokio::sync::Mutex::new(TaskState::Running(task))),
        }
    }
}

fn subscribe(subscribers: &Subscribers) -> mpsc::UnboundedReceiver<Notification> {
    let (tx, rx) = mpsc::unbounded_channel();
    subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(tx);
    rx
}

struct Relay {
    pending: mpsc::UnboundedReceiver<Notification>,
    subscribers: Subscribers,
}

impl Relay {
    /// Forward everything the engine emitted so far.
    fn flush(&mut self) {
        while let Ok(notification) = self.pending.try_recv() {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.retain(|s| s.send(notification.clone()).is_ok());
        }
    }
}

async fn run<F: RangeFetcher>(
    mut engine: TransferEngine<F>,
    mut control_rx: mpsc::Receiver<Control>,
    mut event_rx: mpsc::Receiver<NetworkEvent>,
    mut relay: Relay,
) -> WorkerOutcome {
    // Failures are reported through notifications.
    let _ = engine.start().await;
    relay.flush();

    let outcome = loop {
        match engine.status() {
            TransferStatus::Completed => break WorkerOutcome::Completed,
            TransferStatus::Failed => break WorkerOutcome::Failed,
            _ => {}
        }

        tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                Some(Control::Pause(ack)) => {
                    let result = engine.pause().await;
                    relay.flush();
                    let _ = ack.send(result);
                }
                Some(Control::Resume(ack)) => {
                    let result = engine.resume().await;
                    relay.flush();
                    let _ = ack.send(result);
                }
                Some(Control::Cancel(ack)) => {
                    let result = engine.cancel().await;
                    relay.flush();
                    let _ = ack.send(result);
                    break WorkerOutcome::Cancelled;
                }
                None => {
                    // Every handle is gone; nobody can pause or resume any more.
                    tracing::debug!("Control channel closed; cancelling");
                    let _ = engine.cancel().await;
                    relay.flush();
                    break WorkerOutcome::Cancelled;
                }
            },
            Some(event) = event_rx.recv() => {
                engine.handle_event(event).await;
                relay.flush();
            }
        }
    };

    tracing::debug!(?outcome, bytes = engine.transfer().bytes_downloaded, "Worker finished");
    outcome
}

enum TaskState {
    Running(JoinHandle<WorkerOutcome>),
    Finished(WorkerOutcome),
}

/// Control side of a spawned worker. Cheap to clone.
#[derive(Clone)]
pub struct TransferHandle {
    id: String,
    control: mpsc::Sender<Control>,
    subscribers: Subscribers,
    task: Arc<tokio::sync::Mutex<TaskState>>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns once the worker has checkpointed. No-op if the worker is done.
    pub async fn pause(&self) -> Result<()> {
        self.request(Control::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Control::Resume).await
    }

    /// Stop the worker, keeping a resumable checkpoint.
    pub async fn cancel(&self) -> Result<()> {
        self.request(Control::Cancel).await
    }

    /// Notifications from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        subscribe(&self.subscribers)
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_closed()
    }

    /// Wait for the worker to end. Can be called any number of times.
    pub async fn join(&self) -> WorkerOutcome {
        let mut task = self.task.lock().await;
        let outcome = match &mut *task {
            TaskState::Finished(outcome) => *outcome,
            TaskState::Running(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(id = %self.id, error = %e, "Worker task panicked");
                    WorkerOutcome::Failed
                }
            },
        };
        *task = TaskState::Finished(outcome);
        outcome
    }

    /// Cancel if still running, then join. Immediate for a finished worker.
    pub async fn shutdown(&self) -> WorkerOutcome {
        if !self.is_finished() {
            if let Err(e) = self.cancel().await {
                tracing::warn!(id = %self.id, error = %e, "Checkpoint on shutdown failed");
            }
        }
        self.join().await
    }

    async fn request(&self, make: impl FnOnce(Ack) -> Control) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.control.send(make(ack)).await.is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }
}
