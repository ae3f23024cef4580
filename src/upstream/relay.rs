//! Standalone re-serving adapter for a single live source.
//!
//! The relay keeps re-fetching its source for as long as it lives, drops
//! payloads that look like error pages, optionally realigns them on TS packet
//! boundaries, and re-exposes the bytes at `http://127.0.0.1:PORT/stream.<ext>`.
//! Repeated failures are counted against an error limit (tighter until the
//! source has produced good data once); reaching it fails the relay with the
//! most relevant status seen.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetch::{FetchEvent, FetchOptions, Transport, UpstreamFetch};
use crate::error::Result;
use crate::metrics;
use crate::ts::{FilterPolicy, PacketReassembler, packet};

static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.([a-z0-9]{2,4})($|[?#])").expect("valid regex"));

static METADATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?(xmp|rdf)").expect("valid regex"));

/// Delay before reconnecting after a bad status.
const BAD_STATUS_DELAY: Duration = Duration::from_secs(1);

/// Chunks kept for late subscribers before they start reading.
const BROADCAST_CAPACITY: usize = 256;

/// Receives user-facing connection failure reports.
pub trait FailureSink: Send + Sync {
    /// `None` means the origin never answered.
    fn connection_failure(&self, status: Option<u16>);
}

/// Default sink: an error-level log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFailureSink;

impl FailureSink for LogFailureSink {
    fn connection_failure(&self, status: Option<u16>) {
        match status {
            Some(status) => error!("Connection failure ({})", status),
            None => error!("Connection failure (timeout)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayOptions {
    /// Error limit before the source has produced any good data
    pub initial_error_limit: u32,
    pub error_limit: u32,
    /// Chunks smaller than this are sniffed for text
    pub sniffing_size_limit: usize,
    /// Drop bytes before the first TS sync byte of each consumer
    pub check_sync_byte: bool,
    /// Pipe bytes through a [`PacketReassembler`] with this policy
    pub reassemble: Option<FilterPolicy>,
    /// Overrides the type guessed from the source
    pub content_type: Option<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            initial_error_limit: 2,
            error_limit: 5,
            sniffing_size_limit: 196 * 1024,
            check_sync_byte: false,
            reassemble: None,
            content_type: None,
        }
    }
}

#[derive(Debug, Default)]
struct ErrorTracker {
    level: u32,
    codes: Vec<u16>,
    connectable: bool,
}

impl ErrorTracker {
    /// First 4xx, else first 5xx, else 0.
    fn relevant_status(&self) -> u16 {
        self.codes
            .iter()
            .find(|c| (400..500).contains(*c))
            .or_else(|| self.codes.iter().find(|c| **c >= 500))
            .copied()
            .unwrap_or(0)
    }
}

/// Whether a sample looks like binary media rather than text.
fn is_binary(data: &[u8]) -> bool {
    data.iter()
        .take(1024)
        .any(|b| *b == 0 || (*b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || *b >= 0x80)
}

/// XMP/RDF metadata is textual but legitimate.
fn is_metadata(data: &[u8]) -> bool {
    const LIMIT: usize = 4096;
    let sample = if data.len() > LIMIT {
        let mut s = String::from_utf8_lossy(&data[..LIMIT / 2]).into_owned();
        s.push_str(&String::from_utf8_lossy(&data[data.len() - LIMIT / 2..]));
        s
    } else {
        String::from_utf8_lossy(data).into_owned()
    };
    METADATA.is_match(&sample)
}

pub struct StreamRelay {
    url: String,
    ext: String,
    opts: RelayOptions,
    fetch: FetchOptions,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn FailureSink>,
    tx: broadcast::Sender<Bytes>,
    /// Output produced while nobody is listening
    backlog: Mutex<Vec<Bytes>>,
    errors: Mutex<ErrorTracker>,
    content_type: Mutex<Option<String>>,
    reassembler: Mutex<Option<PacketReassembler>>,
    failure: Mutex<Option<u16>>,
    cancel: CancellationToken,
}

impl StreamRelay {
    pub fn new(
        fetch: FetchOptions,
        transport: Arc<dyn Transport>,
        opts: RelayOptions,
        sink: Arc<dyn FailureSink>,
    ) -> Arc<Self> {
        let ext = EXTENSION
            .captures(&fetch.url)
            .map(|c| c[1].to_ascii_lowercase())
            .unwrap_or_else(|| "ts".to_string());
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        Arc::new(Self {
            url: fetch.url.clone(),
            ext,
            reassembler: Mutex::new(opts.reassemble.map(PacketReassembler::with_policy)),
            content_type: Mutex::new(opts.content_type.clone()),
            opts,
            fetch,
            transport,
            sink,
            tx,
            backlog: Mutex::new(Vec::new()),
            errors: Mutex::new(ErrorTracker::default()),
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn content_type(&self) -> String {
        if let Some(ct) = self.content_type.lock().clone() {
            return ct;
        }
        match self.ext.as_str() {
            "aac" | "aacp" => "audio/aacp".to_string(),
            "mp3" => "audio/mpeg".to_string(),
            _ => "video/MP2T".to_string(),
        }
    }

    /// Status the relay failed with, once it has.
    pub fn failure(&self) -> Option<u16> {
        *self.failure.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the relay fails or is destroyed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Bind the loopback listener and start pulling the source. Returns the
    /// stream endpoint.
    pub async fn start(self: &Arc<Self>, bind: IpAddr) -> Result<String> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(bind, 0)).await?;
        let addr = listener.local_addr()?;
        let endpoint = format!("http://{}/stream.{}", addr, self.ext);

        let app = Router::new().fallback(serve_stream).with_state(self.clone());
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Relay listener error: {}", e);
            }
        });

        let relay = self.clone();
        tokio::spawn(async move { relay.pump().await });

        info!("Relaying {} at {}", self.url, endpoint);
        Ok(endpoint)
    }

    pub fn destroy(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Relay destroyed: {}", self.url);
            self.cancel.cancel();
            if let Some(r) = self.reassembler.lock().as_mut() {
                r.destroy();
            }
        }
    }

    async fn pump(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            self.download().await;
        }
    }

    /// One connection to the source, until it ends or fails.
    async fn download(&self) {
        let (handle, mut events) = UpstreamFetch::start(self.transport.clone(), self.fetch.clone());

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    handle.cancel();
                    return;
                }
                event = events.recv() => event,
            };

            match event {
                Some(FetchEvent::Response(head)) => {
                    if (200..=300).contains(&head.status) {
                        if let Some(ct) = head.content_type() {
                            let mut current = self.content_type.lock();
                            if current.is_none()
                                && (ct.starts_with("audio") || ct.starts_with("video"))
                            {
                                *current = Some(ct.to_string());
                            }
                        }
                        continue;
                    }
                    handle.cancel();
                    if head.status < 200 || head.status >= 400 {
                        self.sink.connection_failure(Some(head.status));
                    }
                    self.internal_error(head.status);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(BAD_STATUS_DELAY) => {}
                    }
                    return;
                }
                Some(FetchEvent::Data(chunk)) => {
                    if self.validate(&chunk) {
                        self.output(chunk);
                    }
                }
                Some(FetchEvent::End(Ok(()))) | None => return,
                Some(FetchEvent::End(Err(e))) => {
                    warn!("Relay source error: {}", e);
                    self.sink.connection_failure(e.status_code());
                    self.internal_error(e.status_code().unwrap_or(0));
                    return;
                }
            }
        }
    }

    fn validate(&self, data: &[u8]) -> bool {
        let skip = data.is_empty()
            || (data.len() < self.opts.sniffing_size_limit
                && !is_binary(data)
                && !is_metadata(data));
        if skip {
            if !data.is_empty() {
                error!("Bad data ({} bytes) from {}", data.len(), self.url);
            }
            return false;
        }
        let mut errors = self.errors.lock();
        errors.level = 0;
        errors.connectable = true;
        true
    }

    fn internal_error(&self, status: u16) {
        let status = {
            let mut errors = self.errors.lock();
            errors.level += 1;
            errors.codes.push(status);
            let limit = if errors.connectable {
                self.opts.error_limit
            } else {
                self.opts.initial_error_limit
            };
            if errors.level < limit {
                return;
            }
            error!(
                "Relay error limit reached ({}) for {}: {:?}",
                errors.level, self.url, errors.codes
            );
            errors.relevant_status()
        };
        *self.failure.lock() = Some(status);
        self.destroy();
    }

    fn output(&self, chunk: Bytes) {
        let pushed = self.reassembler.lock().as_mut().map(|r| r.push(&chunk));
        let data = match pushed {
            None => chunk,
            Some(Ok(Some(cut))) => cut,
            Some(Ok(None)) => return,
            Some(Err(e)) => {
                error!("Relay reassembly failed for {}: {}", self.url, e);
                *self.failure.lock() = Some(0);
                self.destroy();
                return;
            }
        };

        metrics::record_ts_emitted(data.len());
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(data);
        } else {
            self.backlog.lock().push(data);
        }
    }

    /// Byte stream for one consumer: backlog first, then live output.
    fn subscribe(&self) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let rx = self.tx.subscribe();
        let backlog: Vec<Bytes> = std::mem::take(&mut *self.backlog.lock());
        let first = (!backlog.is_empty()).then(|| Bytes::from(backlog.concat()));

        struct Consumer {
            rx: broadcast::Receiver<Bytes>,
            pending: Option<Bytes>,
            synced: bool,
            cancel: CancellationToken,
        }

        let consumer = Consumer {
            rx,
            pending: first,
            synced: !self.opts.check_sync_byte,
            cancel: self.cancel.clone(),
        };

        stream::unfold(consumer, |mut c| async move {
            loop {
                let chunk = match c.pending.take() {
                    Some(chunk) => chunk,
                    None => tokio::select! {
                        _ = c.cancel.cancelled() => return None,
                        received = c.rx.recv() => match received {
                            Ok(chunk) => chunk,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Relay consumer lagged by {} chunks", n);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    },
                };

                let chunk = if c.synced {
                    chunk
                } else {
                    match packet::next_sync(&chunk, 0) {
                        Some(pos) => {
                            c.synced = true;
                            chunk.slice(pos..)
                        }
                        None => continue,
                    }
                };
                if !chunk.is_empty() {
                    return Some((Ok(chunk), c));
                }
            }
        })
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_stream(State(relay): State<Arc<StreamRelay>>, uri: Uri) -> Response {
    let name = uri.path().rsplit('/').next().unwrap_or_default();
    if name != format!("stream.{}", relay.ext()) {
        return (StatusCode::NOT_FOUND, "File not found!").into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, relay.content_type()),
            (header::CONNECTION, "close".to_string()),
        ],
        Body::from_stream(relay.subscribe()),
    )
        .into_response()
}
