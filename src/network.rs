//! The transport seam.
//!
//! A [`RangeFetcher`] issues a request for `[offset, ∞)` of a resource and
//! reports what arrives through an [`EventSink`]: zero or more data events
//! followed by exactly one finish event. Issuing never blocks; the caller
//! learns about the outcome from the events.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use url::Url;

use crate::config::Config;
use crate::error::{Result, TransferError};

#[derive(Debug)]
pub enum NetworkEventKind {
    /// `cumulative` is the absolute offset just past `chunk`; `total` is the
    /// full resource length when the server reported one.
    Data {
        chunk: Bytes,
        cumulative: u64,
        total: Option<u64>,
    },
    Finished(std::result::Result<(), String>),
}

#[derive(Debug)]
pub struct NetworkEvent {
    pub generation: u64,
    pub kind: NetworkEventKind,
}

/// Where a request delivers its events. Tagged with the generation of the
/// request so the receiver can drop anything from an aborted one.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::Sender<NetworkEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<NetworkEvent>) -> Self {
        Self {
            generation,
            tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Returns `false` once the request was aborted or nobody is listening.
    pub async fn data(&self, chunk: Bytes, cumulative: u64, total: Option<u64>) -> bool {
        self.deliver(NetworkEventKind::Data {
            chunk,
            cumulative,
            total,
        })
        .await
    }

    pub async fn finish(&self, result: std::result::Result<(), String>) {
        self.deliver(NetworkEventKind::Finished(result)).await;
    }

    async fn deliver(&self, kind: NetworkEventKind) -> bool {
        if self.is_aborted() {
            return false;
        }
        let event = NetworkEvent {
            generation: self.generation,
            kind,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

/// Abort side of an issued request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    cancel: CancellationToken,
}

impl RequestHandle {
    /// No data events are delivered for this request after `abort` returns.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

pub trait RangeFetcher: Send + Sync + 'static {
    fn issue_range_request(&self, url: &str, start_offset: u64, sink: EventSink) -> Result<RequestHandle>;
}

/// `reqwest`-backed fetcher. Each request streams on its own tokio task.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl RangeFetcher for HttpFetcher {
    fn issue_range_request(&self, url: &str, start_offset: u64, sink: EventSink) -> Result<RequestHandle> {
        let url = Url::parse(url).map_err(|e| TransferError::Network(format!("cannot request {}: {}", url, e)))?;
        let handle = sink.handle();
        let client = self.client.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = sink.aborted() => return,
                outcome = stream_range(&client, url, start_offset, &sink) => outcome,
            };
            if let Err(e) = &outcome {
                tracing::debug!(generation = sink.generation(), error = %e, "range request ended with error");
            }
            sink.finish(outcome.map_err(|e| e.to_string())).await;
        });

        Ok(handle)
    }
}

async fn stream_range(client: &Client, url: Url, start_offset: u64, sink: &EventSink) -> Result<()> {
    let mut request = client.get(url);
    if start_offset > 0 {
        request = request.header(header::RANGE, format!("bytes={}-", start_offset));
    }

    let response = request.send().await?;
    let status = response.status();
    let content_range = response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentRange::parse);

    let (range_start, total) = match status {
        StatusCode::PARTIAL_CONTENT => match content_range {
            Some(ContentRange { start: Some(start), total }) => {
                (start, total.or_else(|| response.content_length().map(|len| start + len)))
            }
            _ => (start_offset, response.content_length().map(|len| start_offset + len)),
        },
        // Server ignored the range header and is sending the whole resource.
        s if s.is_success() => (0, response.content_length()),
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // Nothing left to send: we already hold every byte.
            if let Some(total) = content_range.and_then(|r| r.total).filter(|t| *t == start_offset) {
                sink.data(Bytes::new(), start_offset, Some(total)).await;
                return Ok(());
            }
            return Err(TransferError::Network(format!(
                "server cannot serve bytes from offset {}",
                start_offset
            )));
        }
        s => return Err(TransferError::Network(format!("server responded with {}", s))),
    };

    tracing::debug!(generation = sink.generation(), %status, range_start, ?total, "response started");

    let mut cumulative = range_start;
    if !sink.data(Bytes::new(), cumulative, total).await {
        return Ok(());
    }

    let mut stream = response.bytes_stream();
    while let Some(item) = stream.next().await {
        let chunk = item?;
        if chunk.is_empty() {
            continue;
        }
        cumulative += chunk.len() as u64;
        if !sink.data(chunk, cumulative, total).await {
            break;
        }
    }

    Ok(())
}

/// The parts of a `Content-Range` header we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: Option<u64>,
    total: Option<u64>,
}

impl ContentRange {
    /// `bytes 300-999/1000`, `bytes 300-999/*` or `bytes */1000`.
    fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim();
        let (range, total) = rest.split_once('/')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        let start = match range.trim() {
            "*" => None,
            r => Some(r.split_once('-')?.0.trim().parse().ok()?),
        };
        Some(Self { start, total })
    }
}
