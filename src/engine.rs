//! The per-transfer state machine.
//!
//! A [`TransferEngine`] owns one transfer's destination file and progress
//! record. It is driven by exactly one task (see `worker`), which feeds it
//! control calls and network events one at a time, so the engine itself holds
//! no locks. Bytes are only ever appended, and the record is written after the
//! bytes it describes, so the record can lag the file but never lead it.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::{Result, TransferError};
use crate::network::{EventSink, NetworkEvent, NetworkEventKind, RangeFetcher, RequestHandle};
use crate::state::{Transfer, TransferStatus};
use crate::store::ProgressStore;

/// What an engine reports to the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// `total` is `None` when the server did not report a length.
    Progress { downloaded: u64, total: Option<u64> },
    Completed { path: PathBuf },
    Failed { cause: String },
    PauseStateChanged { paused: bool },
}

pub struct TransferEngine<F: RangeFetcher> {
    transfer: Transfer,
    store: ProgressStore,
    fetcher: Arc<F>,
    events: mpsc::Sender<NetworkEvent>,
    notify: mpsc::UnboundedSender<Notification>,
    file: Option<File>,
    request: Option<RequestHandle>,
    generation: u64,
    started: bool,
    sync_writes: bool,
}

impl<F: RangeFetcher> TransferEngine<F> {
    pub fn new(
        transfer: Transfer,
        store: ProgressStore,
        fetcher: Arc<F>,
        events: mpsc::Sender<NetworkEvent>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            transfer,
            store,
            fetcher,
            events,
            notify,
            file: None,
            request: None,
            generation: 0,
            started: false,
            sync_writes: false,
        }
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn status(&self) -> TransferStatus {
        self.transfer.status
    }

    pub fn is_running(&self) -> bool {
        self.started && self.transfer.status == TransferStatus::InProgress
    }

    /// Open the destination for append and request everything past its current size.
    ///
    /// The file size, not the progress record, decides the resume offset.
    /// On failure the transfer is `Failed`, a failure notification has been
    /// emitted, and the record is left on disk.
    pub async fn start(&mut self) -> Result<()> {
        if self.transfer.status.is_terminal() || self.is_running() {
            return Ok(());
        }
        match self.begin().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn begin(&mut self) -> Result<()> {
        let destination = self.transfer.destination.clone();
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&destination)
            .await
            .map_err(|e| TransferError::io(&destination, e))?;
        let offset = file
            .metadata()
            .await
            .map_err(|e| TransferError::io(&destination, e))?
            .len();

        match self.store.load(&self.transfer.id).await {
            Ok(Some(record)) => {
                if record.downloaded != offset {
                    tracing::debug!(
                        id = %self.transfer.id,
                        recorded = record.downloaded,
                        on_disk = offset,
                        "Progress record disagrees with destination size; using destination size"
                    );
                }
                if self.transfer.bytes_total == 0 {
                    self.transfer.bytes_total = record.total;
                }
            }
            Ok(None) => {}
            Err(e @ TransferError::CorruptRecord { .. }) => {
                tracing::warn!(error = %e, "Replacing unreadable progress record");
            }
            Err(e) => return Err(e),
        }

        if self.transfer.bytes_total > 0 && offset > self.transfer.bytes_total {
            tracing::warn!(
                id = %self.transfer.id,
                on_disk = offset,
                recorded_total = self.transfer.bytes_total,
                "Destination is larger than the recorded total; forgetting the total"
            );
            self.transfer.bytes_total = 0;
        }

        self.transfer.bytes_downloaded = offset;
        self.transfer.status = TransferStatus::InProgress;
        self.started = true;
        self.file = Some(file);
        self.generation += 1;

        if self.transfer.bytes_total > 0 && offset == self.transfer.bytes_total {
            tracing::info!(id = %self.transfer.id, bytes = offset, "Destination already complete");
            return self.complete().await;
        }

        self.checkpoint().await?;

        let sink = EventSink::new(self.generation, self.events.clone());
        let handle = self
            .fetcher
            .issue_range_request(&self.transfer.source_url, offset, sink)?;
        self.request = Some(handle);

        tracing::info!(
            id = %self.transfer.id,
            offset,
            generation = self.generation,
            "Range request issued"
        );
        Ok(())
    }

    /// Abort the request and checkpoint as `Paused`. No-op unless running.
    ///
    /// Anything the aborted request still delivers is discarded.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if let Err(e) = self.halt().await {
            self.fail(&e).await;
            return Err(e);
        }
        tracing::info!(id = %self.transfer.id, bytes = self.transfer.bytes_downloaded, "Paused");
        self.emit(Notification::PauseStateChanged { paused: true });
        Ok(())
    }

    /// Continue a paused transfer from the current destination size. No-op unless paused.
    pub async fn resume(&mut self) -> Result<()> {
        if self.transfer.status != TransferStatus::Paused {
            return Ok(());
        }
        tracing::info!(id = %self.transfer.id, "Resuming");
        self.emit(Notification::PauseStateChanged { paused: false });
        self.start().await
    }

    /// Stop for good, leaving a `Paused` checkpoint a later run can pick up.
    pub async fn cancel(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        tracing::info!(id = %self.transfer.id, bytes = self.transfer.bytes_downloaded, "Cancelled");
        self.halt().await
    }

    async fn halt(&mut self) -> Result<()> {
        self.abort_request();
        self.transfer.status = TransferStatus::Paused;
        let closed = self.close_file().await;
        let saved = self.checkpoint().await;
        closed.and(saved)
    }

    /// Apply one event from the network side.
    ///
    /// Events from an earlier generation, or arriving while not running, are dropped.
    pub async fn handle_event(&mut self, event: NetworkEvent) {
        if event.generation != self.generation || !self.is_running() {
            tracing::trace!(
                id = %self.transfer.id,
                event_generation = event.generation,
                generation = self.generation,
                "Discarding stale network event"
            );
            return;
        }

        match event.kind {
            NetworkEventKind::Data {
                chunk,
                cumulative,
                total,
            } => self.on_data(chunk, cumulative, total).await,
            NetworkEventKind::Finished(Ok(())) => self.on_success().await,
            NetworkEventKind::Finished(Err(cause)) => self.fail(&TransferError::Network(cause)).await,
        }
    }

    async fn on_data(&mut self, chunk: Bytes, cumulative: u64, total: Option<u64>) {
        let have = self.transfer.bytes_downloaded;
        if let Some(total) = total.filter(|t| *t > 0) {
            if total < have {
                let e = TransferError::Network(format!(
                    "resource is {} bytes but the destination already holds {}",
                    total, have
                ));
                return self.fail(&e).await;
            }
            self.transfer.bytes_total = total;
        }

        let len = chunk.len() as u64;
        let Some(chunk_start) = cumulative.checked_sub(len) else {
            let e = TransferError::Network(format!("{} bytes reported ending at offset {}", len, cumulative));
            return self.fail(&e).await;
        };

        if chunk_start > have {
            let e = TransferError::Network(format!(
                "server resumed at offset {} but the destination holds {} bytes",
                chunk_start, have
            ));
            return self.fail(&e).await;
        }

        if cumulative <= have {
            if len > 0 {
                tracing::debug!(id = %self.transfer.id, chunk_start, len, "Dropping bytes already on disk");
            } else {
                self.emit_progress();
            }
            return;
        }

        if self.transfer.bytes_total > 0 && cumulative > self.transfer.bytes_total {
            let e = TransferError::Network(format!(
                "received {} bytes of a {} byte resource",
                cumulative, self.transfer.bytes_total
            ));
            return self.fail(&e).await;
        }

        let fresh = chunk.slice((have - chunk_start) as usize..);
        if let Err(e) = self.append(&fresh).await {
            return self.fail(&e).await;
        }
        self.transfer.bytes_downloaded = cumulative;

        if let Err(e) = self.checkpoint().await {
            return self.fail(&e).await;
        }
        self.emit_progress();
    }

    async fn on_success(&mut self) {
        let total = self.transfer.bytes_total;
        let have = self.transfer.bytes_downloaded;
        if total > 0 && have != total {
            let e = if have < total {
                TransferError::Network(format!("connection closed after {} of {} bytes", have, total))
            } else {
                TransferError::Network(format!("received {} bytes of a {} byte resource", have, total))
            };
            return self.fail(&e).await;
        }
        if let Err(e) = self.complete().await {
            self.fail(&e).await;
        }
    }

    async fn complete(&mut self) -> Result<()> {
        self.request = None;
        self.close_file().await?;
        self.store.remove(&self.transfer.id).await?;
        self.transfer.status = TransferStatus::Completed;
        if self.transfer.bytes_total == 0 {
            self.transfer.bytes_total = self.transfer.bytes_downloaded;
        }
        tracing::info!(
            id = %self.transfer.id,
            bytes = self.transfer.bytes_downloaded,
            path = %self.transfer.destination.display(),
            "Completed"
        );
        self.emit(Notification::Completed {
            path: self.transfer.destination.clone(),
        });
        Ok(())
    }

    /// Terminal failure: the record stays on disk with the last confirmed offset.
    async fn fail(&mut self, err: &TransferError) {
        self.abort_request();
        if let Err(e) = self.close_file().await {
            tracing::warn!(id = %self.transfer.id, error = %e, "Failed to close destination");
        }
        self.transfer.status = TransferStatus::Failed;
        if let Err(e) = self.record_failure().await {
            tracing::warn!(id = %self.transfer.id, error = %e, "Failed to record failure");
        }
        tracing::warn!(
            id = %self.transfer.id,
            bytes = self.transfer.bytes_downloaded,
            error = %err,
            "Transfer failed"
        );
        self.emit(Notification::Failed {
            cause: err.to_string(),
        });
    }

    /// Mark the record failed. Before `begin` has measured the destination the
    /// in-memory counts mean nothing, so an earlier record keeps its counts.
    async fn record_failure(&self) -> Result<()> {
        if self.started {
            return self.checkpoint().await;
        }
        match self.store.load(&self.transfer.id).await? {
            Some(mut record) => {
                record.status = TransferStatus::Failed;
                self.store.save(&self.transfer.id, &record).await
            }
            None => self.checkpoint().await,
        }
    }

    fn abort_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
        self.generation += 1;
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let path = &self.transfer.destination;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::io(path, std::io::Error::other("destination is not open")))?;
        file.write_all(bytes).await.map_err(|e| TransferError::io(path, e))?;
        file.flush().await.map_err(|e| TransferError::io(path, e))?;
        if self.sync_writes {
            file.sync_data().await.map_err(|e| TransferError::io(path, e))?;
        }
        Ok(())
    }

    async fn close_file(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            let path = &self.transfer.destination;
            file.flush().await.map_err(|e| TransferError::io(path, e))?;
            file.sync_all().await.map_err(|e| TransferError::io(path, e))?;
        }
        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        self.store.save(&self.transfer.id, &self.transfer.to_record()).await
    }

    fn emit_progress(&self) {
        self.emit(Notification::Progress {
            downloaded: self.transfer.bytes_downloaded,
            total: self.transfer.total(),
        });
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::ScriptedFetcher;
    use crate::state::ProgressRecord;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const URL: &str = "https://example.com/data.bin";

    struct Harness {
        dir: TempDir,
        fetcher: Arc<ScriptedFetcher>,
        engine: TransferEngine<ScriptedFetcher>,
        events_tx: mpsc::Sender<NetworkEvent>,
        events: mpsc::Receiver<NetworkEvent>,
        notes: mpsc::UnboundedReceiver<Notification>,
        store: ProgressStore,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store = ProgressStore::new(dir.path().join(".progress"));
            let fetcher = Arc::new(ScriptedFetcher::new());
            let (events_tx, events) = mpsc::channel(64);
            let (notify_tx, notes) = mpsc::unbounded_channel();
            let transfer = Transfer::new("data.bin", URL, dir.path().join("data.bin"));
            let engine = TransferEngine::new(transfer, store.clone(), fetcher.clone(), events_tx.clone(), notify_tx);
            Self {
                dir,
                fetcher,
                engine,
                events_tx,
                events,
                notes,
                store,
            }
        }

        fn destination(&self) -> std::path::PathBuf {
            self.dir.path().join("data.bin")
        }

        fn file_len(&self) -> u64 {
            file_len(&self.destination())
        }

        async fn record(&self) -> Option<ProgressRecord> {
            self.store.load("data.bin").await.unwrap()
        }

        /// Push data through the current request's sink and apply whatever arrives.
        async fn data(&mut self, bytes: &[u8], cumulative: u64, total: Option<u64>) {
            let sink = self.fetcher.last_sink();
            assert!(sink.data(Bytes::copy_from_slice(bytes), cumulative, total).await);
            self.pump().await;
        }

        async fn finish(&mut self, result: std::result::Result<(), String>) {
            self.fetcher.last_sink().finish(result).await;
            self.pump().await;
        }

        async fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.engine.handle_event(event).await;
            }
        }

        fn drain_notes(&mut self) -> Vec<Notification> {
            let mut notes = vec![];
            while let Ok(n) = self.notes.try_recv() {
                notes.push(n);
            }
            notes
        }
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    fn pattern(range: std::ops::Range<u64>) -> Vec<u8> {
        range.map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn start_creates_record_and_requests_from_zero() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();

        assert_eq!(h.fetcher.offsets(), vec![0]);
        assert!(h.engine.is_running());
        let record = h.record().await.unwrap();
        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(record.downloaded, 0);
        assert_eq!(record.url, URL);
    }

    #[tokio::test]
    async fn completes_a_1000_byte_transfer() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();

        h.data(&[], 0, Some(1000)).await;
        h.data(&pattern(0..250), 250, Some(1000)).await;
        assert_eq!(h.record().await.unwrap().downloaded, 250);
        h.data(&pattern(250..600), 600, Some(1000)).await;
        h.data(&pattern(600..1000), 1000, Some(1000)).await;
        h.finish(Ok(())).await;

        assert_eq!(h.engine.status(), TransferStatus::Completed);
        assert_eq!(h.file_len(), 1000);
        assert_eq!(std::fs::read(h.destination()).unwrap(), pattern(0..1000));
        assert_eq!(h.record().await, None);

        let notes = h.drain_notes();
        let completed: Vec<_> = notes
            .iter()
            .filter(|n| matches!(n, Notification::Completed { .. }))
            .collect();
        assert_eq!(completed, vec![&Notification::Completed { path: h.destination() }]);
        assert!(notes.contains(&Notification::Progress {
            downloaded: 600,
            total: Some(1000)
        }));
    }

    #[tokio::test]
    async fn downloaded_tracks_last_event_and_file_size() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();

        let marks = [1u64, 2, 17, 512, 513, 4096];
        let mut prev = 0;
        for mark in marks {
            h.data(&pattern(prev..mark), mark, None).await;
            assert_eq!(h.engine.transfer().bytes_downloaded, mark);
            assert_eq!(h.file_len(), mark);
            assert_eq!(h.record().await.unwrap().downloaded, mark);
            prev = mark;
        }
        assert_eq!(std::fs::read(h.destination()).unwrap(), pattern(0..4096));
    }

    #[tokio::test]
    async fn unknown_total_is_reported_as_none() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..10), 10, Some(0)).await;
        h.data(&pattern(10..20), 20, None).await;

        let progress: Vec<_> = h
            .drain_notes()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Progress { total, .. } => Some(total),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![None, None]);
        assert_eq!(h.record().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn pause_checkpoints_and_aborts() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..300), 300, None).await;

        h.engine.pause().await.unwrap();

        assert!(h.fetcher.last_sink().is_aborted());
        assert_eq!(h.engine.status(), TransferStatus::Paused);
        assert_eq!(h.file_len(), 300);
        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.status), (300, TransferStatus::Paused));
        assert_eq!(
            h.drain_notes().last(),
            Some(&Notification::PauseStateChanged { paused: true })
        );

        // Pausing twice changes nothing.
        h.engine.pause().await.unwrap();
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn events_after_pause_are_discarded() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        let old_generation = h.engine.generation;
        h.data(&pattern(0..300), 300, None).await;

        // Already queued when pause runs.
        h.events_tx
            .send(NetworkEvent {
                generation: old_generation,
                kind: NetworkEventKind::Data {
                    chunk: Bytes::from(pattern(300..400)),
                    cumulative: 400,
                    total: None,
                },
            })
            .await
            .unwrap();
        h.engine.pause().await.unwrap();
        h.pump().await;

        assert_eq!(h.engine.transfer().bytes_downloaded, 300);
        assert_eq!(h.file_len(), 300);

        // And after resume, the old generation is still ignored.
        h.engine.resume().await.unwrap();
        for _ in 0..2 {
            h.events_tx
                .send(NetworkEvent {
                    generation: old_generation,
                    kind: NetworkEventKind::Finished(Ok(())),
                })
                .await
                .unwrap();
            h.pump().await;
        }
        assert!(h.engine.is_running());
        assert_eq!(h.file_len(), 300);
    }

    #[tokio::test]
    async fn resume_requests_from_file_size() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..300), 300, None).await;
        h.engine.pause().await.unwrap();
        h.drain_notes();

        h.engine.resume().await.unwrap();

        assert_eq!(h.fetcher.offsets(), vec![0, 300]);
        assert_eq!(h.engine.transfer().bytes_downloaded, 300);
        assert_eq!(h.record().await.unwrap().status, TransferStatus::InProgress);
        assert_eq!(
            h.drain_notes(),
            vec![Notification::PauseStateChanged { paused: false }]
        );

        h.data(&pattern(300..500), 500, Some(500)).await;
        h.finish(Ok(())).await;
        assert_eq!(h.engine.status(), TransferStatus::Completed);
        assert_eq!(std::fs::read(h.destination()).unwrap(), pattern(0..500));
    }

    #[tokio::test]
    async fn resume_is_a_no_op_unless_paused() {
        let mut h = Harness::new();
        h.engine.resume().await.unwrap();
        assert_eq!(h.fetcher.request_count(), 0);

        h.engine.start().await.unwrap();
        h.engine.resume().await.unwrap();
        assert_eq!(h.fetcher.request_count(), 1);
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn pause_before_start_does_nothing() {
        let mut h = Harness::new();
        h.engine.pause().await.unwrap();
        assert_eq!(h.record().await, None);
        assert!(h.drain_notes().is_empty());
    }

    #[tokio::test]
    async fn network_error_keeps_record_and_does_not_retry() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..150), 150, Some(1000)).await;
        h.finish(Err("connection reset".into())).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.status), (150, TransferStatus::Failed));
        assert_eq!(h.file_len(), 150);
        assert_eq!(h.fetcher.request_count(), 1);

        let notes = h.drain_notes();
        assert!(matches!(
            notes.last(),
            Some(Notification::Failed { cause }) if cause.contains("connection reset")
        ));

        // Terminal for this engine.
        h.engine.resume().await.unwrap();
        h.engine.start().await.unwrap();
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn new_engine_resumes_a_failed_transfer() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..150), 150, Some(400)).await;
        h.finish(Err("timed out".into())).await;

        let (notify_tx, _notes) = mpsc::unbounded_channel();
        let transfer = Transfer::new("data.bin", URL, h.destination());
        let mut engine = TransferEngine::new(transfer, h.store.clone(), h.fetcher.clone(), h.events_tx.clone(), notify_tx);
        engine.start().await.unwrap();

        assert_eq!(h.fetcher.offsets(), vec![0, 150]);
        assert_eq!(engine.transfer().bytes_total, 400);
        assert_eq!(h.record().await.unwrap().status, TransferStatus::InProgress);
    }

    #[tokio::test]
    async fn early_close_with_known_total_fails() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..100), 100, Some(1000)).await;
        h.finish(Ok(())).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert_eq!(h.record().await.unwrap().downloaded, 100);
    }

    #[tokio::test]
    async fn duplicate_bytes_from_restarted_server_are_dropped() {
        let mut h = Harness::new();
        std::fs::write(h.destination(), pattern(0..300)).unwrap();
        h.engine.start().await.unwrap();
        assert_eq!(h.fetcher.offsets(), vec![300]);

        // Server ignored the range and starts from zero.
        h.data(&[], 0, Some(1000)).await;
        h.data(&pattern(0..200), 200, Some(1000)).await;
        h.data(&pattern(200..450), 450, Some(1000)).await;
        h.data(&pattern(450..1000), 1000, Some(1000)).await;
        h.finish(Ok(())).await;

        assert_eq!(h.engine.status(), TransferStatus::Completed);
        assert_eq!(std::fs::read(h.destination()).unwrap(), pattern(0..1000));
    }

    #[tokio::test]
    async fn gap_in_resumed_range_fails() {
        let mut h = Harness::new();
        std::fs::write(h.destination(), pattern(0..300)).unwrap();
        h.engine.start().await.unwrap();

        h.data(&pattern(400..500), 500, Some(1000)).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert_eq!(h.file_len(), 300);
        assert_eq!(h.record().await.unwrap().downloaded, 300);
    }

    #[tokio::test]
    async fn file_size_wins_over_stale_record() {
        let mut h = Harness::new();
        std::fs::write(h.destination(), pattern(0..120)).unwrap();
        h.store
            .save(
                "data.bin",
                &ProgressRecord {
                    url: URL.into(),
                    downloaded: 80,
                    total: 1000,
                    status: TransferStatus::Paused,
                },
            )
            .await
            .unwrap();

        h.engine.start().await.unwrap();

        assert_eq!(h.fetcher.offsets(), vec![120]);
        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.total), (120, 1000));
    }

    #[tokio::test]
    async fn already_complete_file_skips_the_request() {
        let mut h = Harness::new();
        std::fs::write(h.destination(), pattern(0..64)).unwrap();
        h.store
            .save(
                "data.bin",
                &ProgressRecord {
                    url: URL.into(),
                    downloaded: 64,
                    total: 64,
                    status: TransferStatus::Paused,
                },
            )
            .await
            .unwrap();

        h.engine.start().await.unwrap();

        assert_eq!(h.fetcher.request_count(), 0);
        assert_eq!(h.engine.status(), TransferStatus::Completed);
        assert_eq!(h.record().await, None);
    }

    #[tokio::test]
    async fn refused_request_fails_start() {
        let mut h = Harness::new();
        h.fetcher.refuse_requests();

        let err = h.engine.start().await.unwrap_err();

        assert!(matches!(err, TransferError::Network(_)));
        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert_eq!(h.record().await.unwrap().status, TransferStatus::Failed);
        assert!(matches!(h.drain_notes().as_slice(), [Notification::Failed { .. }]));
    }

    #[tokio::test]
    async fn unwritable_destination_is_an_io_error() {
        let mut h = Harness::new();
        std::fs::create_dir(h.destination()).unwrap();

        let err = h.engine.start().await.unwrap_err();

        assert!(matches!(err, TransferError::Io { .. }));
        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert_eq!(h.fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn failed_open_keeps_the_earlier_checkpoint() {
        let mut h = Harness::new();
        h.store
            .save(
                "data.bin",
                &ProgressRecord {
                    url: URL.into(),
                    downloaded: 300,
                    total: 1000,
                    status: TransferStatus::Paused,
                },
            )
            .await
            .unwrap();
        std::fs::create_dir(h.destination()).unwrap();

        h.engine.start().await.unwrap_err();

        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.total), (300, 1000));
        assert_eq!(record.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn total_smaller_than_destination_fails() {
        let mut h = Harness::new();
        std::fs::write(h.destination(), pattern(0..500)).unwrap();
        h.engine.start().await.unwrap();
        h.drain_notes();

        // Server ignored the range and the resource has shrunk.
        h.data(&[], 0, Some(300)).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert!(h.fetcher.last_sink().is_aborted());
        assert_eq!(h.file_len(), 500);
        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.status), (500, TransferStatus::Failed));
        assert!(matches!(
            h.drain_notes().as_slice(),
            [Notification::Failed { cause }] if cause.contains("300 bytes")
        ));
    }

    #[tokio::test]
    async fn write_failure_mid_transfer_fails_and_keeps_the_record() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..100), 100, Some(1000)).await;

        // A read-only handle makes the next append fail.
        h.engine.file = Some(File::open(h.destination()).await.unwrap());
        h.data(&pattern(100..200), 200, Some(1000)).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert!(h.fetcher.last_sink().is_aborted());
        let record = h.record().await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(record.downloaded, 100);
        assert!(record.downloaded <= h.file_len());
        assert!(matches!(h.drain_notes().last(), Some(Notification::Failed { .. })));
    }

    #[tokio::test]
    async fn checkpoint_failure_mid_transfer_fails() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..100), 100, Some(1000)).await;

        let progress_dir = h.dir.path().join(".progress");
        std::fs::remove_dir_all(&progress_dir).unwrap();
        std::fs::write(&progress_dir, b"").unwrap();
        h.data(&pattern(100..200), 200, Some(1000)).await;

        assert_eq!(h.engine.status(), TransferStatus::Failed);
        assert!(h.fetcher.last_sink().is_aborted());
        assert_eq!(h.file_len(), 200);
        assert!(matches!(
            h.drain_notes().last(),
            Some(Notification::Failed { cause }) if cause.contains("I/O error")
        ));
    }

    #[tokio::test]
    async fn cancel_leaves_a_paused_checkpoint_quietly() {
        let mut h = Harness::new();
        h.engine.start().await.unwrap();
        h.data(&pattern(0..42), 42, None).await;
        h.drain_notes();

        h.engine.cancel().await.unwrap();

        assert!(h.fetcher.last_sink().is_aborted());
        let record = h.record().await.unwrap();
        assert_eq!((record.downloaded, record.status), (42, TransferStatus::Paused));
        assert!(h.drain_notes().is_empty());
    }

    #[test]
    fn notifications_serialize_with_event_tag() {
        let json = serde_json::to_string(&Notification::Progress {
            downloaded: 5,
            total: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"progress","downloaded":5,"total":null}"#);
    }
}
