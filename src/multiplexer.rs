//! Fan-out of one upstream response to any number of local clients.
//!
//! A [`RequestMultiplexer`] owns the bytes of one resource. Writes from the
//! single producer are cut into fixed-size fragments. A pump pass delivers
//! every full fragment (and the trailing partial one once the stream has
//! ended) to each attached client, in order. Pump passes never overlap:
//! a pump requested while one runs is folded into a single follow-up pass.
//! After each pass, fragments every client has moved past are spilled to the
//! instance's scratch directory and only their path is kept in memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{HeadersSidecar, SpillStore};
use crate::error::ProxyError;
use crate::hls::parser;
use crate::upstream::{FetchHandle, ResponseHead};

/// Manifests older than this are refetched instead of shared.
pub const META_TTL: Duration = Duration::from_secs(2);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Meta,
    Segment,
    Other,
}

impl MediaKind {
    pub fn from_url(url: &str) -> Self {
        if parser::is_manifest(None, url) {
            Self::Meta
        } else if parser::is_segment_url(url) {
            Self::Segment
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Meta => "manifest",
            Self::Segment => "segment",
            Self::Other => "other",
        }
    }
}

/// Why a multiplexed response ended early. Cloned to every client.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("HTTP {0}: {1}")]
    Status(u16, String),
    #[error("cancelled")]
    Cancelled,
    #[error("aborted: {0}")]
    Aborted(String),
}

impl Failure {
    pub fn from_error(err: &ProxyError) -> Self {
        match err {
            ProxyError::Timeout(m) => Self::Timeout(m.clone()),
            ProxyError::Cancelled => Self::Cancelled,
            other => match other.status_code() {
                Some(status) => Self::Status(status, other.to_string()),
                None => Self::Aborted(other.to_string()),
            },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(status, _) => Some(*status),
            _ => None,
        }
    }

    pub fn into_error(self, url: &str) -> ProxyError {
        match self {
            Self::Timeout(m) => ProxyError::Timeout(m),
            Self::Status(status, _) => ProxyError::UpstreamStatus {
                status,
                url: url.to_string(),
            },
            Self::Cancelled => ProxyError::Cancelled,
            Self::Aborted(m) => ProxyError::Aborted(m),
        }
    }
}

pub type Outcome = std::result::Result<(), Failure>;

#[derive(Debug)]
pub enum ClientEvent {
    Head(ResponseHead),
    Data(Bytes),
    End(Outcome),
}

#[derive(Debug)]
enum Fragment {
    Memory(Bytes),
    Spilled { path: PathBuf, size: usize },
}

impl Fragment {
    fn len(&self) -> usize {
        match self {
            Self::Memory(b) => b.len(),
            Self::Spilled { size, .. } => *size,
        }
    }
}

enum Piece {
    Memory(Bytes),
    Disk(PathBuf),
}

struct ClientSlot {
    id: u64,
    shadow: bool,
    tx: mpsc::UnboundedSender<ClientEvent>,
    responded: bool,
    /// Index of the next fragment to deliver
    next: usize,
    delivered: u64,
    finished: bool,
}

struct Delivery {
    id: u64,
    tx: mpsc::UnboundedSender<ClientEvent>,
    head: Option<ResponseHead>,
    pieces: Vec<Piece>,
    next: usize,
    end: Option<Outcome>,
}

struct MuxInner {
    kind: MediaKind,
    /// Sealed fragments, all `fragment_size` long except possibly the last
    fragments: Vec<Fragment>,
    /// Fragment being filled
    open: BytesMut,
    bytes_written: u64,
    head: Option<ResponseHead>,
    /// Set once the producer is done
    outcome: Option<Outcome>,
    content_length: Option<u64>,
    clients: Vec<ClientSlot>,
    fetch: Option<FetchHandle>,
    created_at: Instant,
    generation: u64,
    pumping: bool,
    pump_again: bool,
    headers_written: bool,
    destroyed: bool,
}

pub struct RequestMultiplexer {
    url: String,
    stem: String,
    fragment_size: usize,
    store: Option<Arc<SpillStore>>,
    inner: Mutex<MuxInner>,
}

impl std::fmt::Debug for RequestMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMultiplexer")
            .field("url", &self.url)
            .field("fragments", &self.fragment_count())
            .field("clients", &self.client_count())
            .finish()
    }
}

impl RequestMultiplexer {
    pub fn new(
        url: impl Into<String>,
        kind: MediaKind,
        fragment_size: usize,
        store: Option<Arc<SpillStore>>,
    ) -> Arc<Self> {
        let url = url.into();
        Arc::new(Self {
            stem: SpillStore::file_stem(&url),
            url,
            fragment_size: fragment_size.max(1),
            store,
            inner: Mutex::new(MuxInner {
                kind,
                fragments: Vec::new(),
                open: BytesMut::new(),
                bytes_written: 0,
                head: None,
                outcome: None,
                content_length: None,
                clients: Vec::new(),
                fetch: None,
                created_at: Instant::now(),
                generation: 0,
                pumping: false,
                pump_again: false,
                headers_written: false,
                destroyed: false,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.lock().kind
    }

    pub fn set_kind(&self, kind: MediaKind) {
        self.inner.lock().kind = kind;
    }

    pub fn created_at(&self) -> Instant {
        self.inner.lock().created_at
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Known once the stream has ended.
    pub fn content_length(&self) -> Option<u64> {
        self.inner.lock().content_length
    }

    pub fn head(&self) -> Option<ResponseHead> {
        self.inner.lock().head.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Ended with a failure; nothing new can be served from it.
    pub fn failed(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Err(_)))
    }

    /// Fragments held, in memory or on disk, including the one being filled.
    pub fn fragment_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.fragments.len() + usize::from(!inner.open.is_empty())
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn has_real_clients(&self) -> bool {
        self.inner.lock().clients.iter().any(|c| !c.shadow)
    }

    /// A finished manifest past [`META_TTL`] must not be shared.
    pub fn expired(&self) -> bool {
        let inner = self.inner.lock();
        inner.kind == MediaKind::Meta && inner.created_at.elapsed() > META_TTL
    }

    pub fn set_fetch(&self, fetch: FetchHandle) {
        self.inner.lock().fetch = Some(fetch);
    }

    pub fn fetch(&self) -> Option<FetchHandle> {
        self.inner.lock().fetch.clone()
    }

    /// Append producer bytes.
    pub fn write(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() || inner.destroyed {
            warn!("Write after end ignored for {}", self.url);
            return;
        }

        let mut rest = chunk;
        while !rest.is_empty() {
            let room = self.fragment_size - inner.open.len();
            let take = room.min(rest.len());
            inner.open.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if inner.open.len() >= self.fragment_size {
                let full = inner.open.split().freeze();
                inner.fragments.push(Fragment::Memory(full));
            }
        }
        inner.bytes_written += chunk.len() as u64;
    }

    /// Mark the producer done. The partial fragment becomes deliverable and
    /// the fetch handle is released.
    pub fn end(&self, outcome: Outcome) {
        let mut inner = self.inner.lock();
        if inner.outcome.is_some() {
            return;
        }
        if !inner.open.is_empty() {
            let last = inner.open.split().freeze();
            inner.fragments.push(Fragment::Memory(last));
        }
        inner.content_length = Some(inner.fragments.iter().map(|f| f.len() as u64).sum());
        inner.outcome = Some(outcome);
        inner.fetch = None;
    }

    /// Set the response head clients will receive before any data.
    pub fn respond(&self, head: ResponseHead) {
        self.inner.lock().head = Some(head);
    }

    /// Swap the whole body, e.g. for a rewritten manifest. Only valid
    /// before the stream has ended.
    pub fn replace_body(&self, body: Bytes) {
        {
            let mut inner = self.inner.lock();
            inner.fragments.clear();
            inner.open.clear();
            inner.bytes_written = 0;
        }
        self.write(&body);
    }

    /// Whole body, if it is still entirely in memory.
    pub fn body(&self) -> Option<Bytes> {
        let inner = self.inner.lock();
        let mut out = BytesMut::with_capacity(inner.bytes_written as usize);
        for fragment in &inner.fragments {
            match fragment {
                Fragment::Memory(b) => out.extend_from_slice(b),
                Fragment::Spilled { .. } => return None,
            }
        }
        out.extend_from_slice(&inner.open);
        Some(out.freeze())
    }

    /// Forget the previous response, keeping identity and clients, so the
    /// resource can be fetched again.
    pub fn reset(&self, kind: MediaKind) {
        let spilled = {
            let mut inner = self.inner.lock();
            let spilled = take_spilled(&mut inner.fragments);
            inner.open.clear();
            inner.bytes_written = 0;
            inner.head = None;
            inner.outcome = None;
            inner.content_length = None;
            inner.created_at = Instant::now();
            inner.generation += 1;
            inner.kind = kind;
            inner.headers_written = false;
            inner.clients.retain(|c| !c.finished);
            for client in &mut inner.clients {
                client.next = 0;
                client.responded = false;
            }
            spilled
        };
        debug!("Reset {}", self.url);
        self.discard_later(spilled);
    }

    /// Attach a client. Shadow clients are detached automatically once their
    /// receiver is gone.
    pub fn add_client(self: &Arc<Self>, shadow: bool) -> ClientHandle {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = {
            let mut inner = self.inner.lock();
            inner.clients.push(ClientSlot {
                id,
                shadow,
                tx,
                responded: false,
                next: 0,
                delivered: 0,
                finished: false,
            });
            inner.head.is_some() || inner.outcome.is_some()
        };
        if ready {
            self.schedule_pump();
        }
        ClientHandle {
            id,
            shadow,
            mux: Some(self.clone()),
            rx,
            done: false,
        }
    }

    pub fn remove_client(&self, id: u64) {
        self.inner.lock().clients.retain(|c| c.id != id);
    }

    /// Bytes delivered so far to a client.
    pub fn delivered_to(&self, id: u64) -> Option<u64> {
        self.inner
            .lock()
            .clients
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.delivered)
    }

    pub fn schedule_pump(self: &Arc<Self>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mux = self.clone();
            handle.spawn(async move { mux.pump().await });
        }
    }

    /// Deliver whatever is deliverable, then spill what was delivered.
    pub async fn pump(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.pumping {
                inner.pump_again = true;
                return;
            }
            inner.pumping = true;
        }

        loop {
            self.pump_pass().await;
            let finalize = self.is_ended();
            self.offload(finalize).await;

            let mut inner = self.inner.lock();
            if inner.pump_again {
                inner.pump_again = false;
                continue;
            }
            inner.pumping = false;
            break;
        }
    }

    async fn pump_pass(&self) {
        let (generation, deliveries) = {
            let inner = self.inner.lock();
            if inner.destroyed {
                return;
            }

            let mut deliveries = Vec::new();
            for client in inner.clients.iter().filter(|c| !c.finished) {
                let mut delivery = Delivery {
                    id: client.id,
                    tx: client.tx.clone(),
                    head: None,
                    pieces: Vec::new(),
                    next: client.next,
                    end: None,
                };

                if !client.responded {
                    match (&inner.head, &inner.outcome) {
                        (Some(head), _) => delivery.head = Some(head.clone()),
                        (None, Some(outcome)) => {
                            delivery.end = Some(match outcome {
                                Err(f) => Err(f.clone()),
                                Ok(()) => Err(Failure::Aborted("no response".to_string())),
                            });
                            deliveries.push(delivery);
                            continue;
                        }
                        (None, None) => continue,
                    }
                }

                for fragment in inner.fragments.iter().skip(client.next) {
                    delivery.pieces.push(match fragment {
                        Fragment::Memory(b) => Piece::Memory(b.clone()),
                        Fragment::Spilled { path, .. } => Piece::Disk(path.clone()),
                    });
                }
                delivery.next = inner.fragments.len();
                delivery.end = inner.outcome.clone();

                if delivery.head.is_some() || !delivery.pieces.is_empty() || delivery.end.is_some()
                {
                    deliveries.push(delivery);
                }
            }
            (inner.generation, deliveries)
        };

        for delivery in deliveries {
            let sent_head = delivery.head.is_some();
            let mut open = true;
            let mut delivered = 0u64;
            let mut read_failure = None;

            if let Some(head) = delivery.head {
                open = delivery.tx.send(ClientEvent::Head(head)).is_ok();
            }
            for piece in delivery.pieces {
                if !open {
                    break;
                }
                let data = match piece {
                    Piece::Memory(b) => b,
                    Piece::Disk(path) => match self.read_spilled(&path).await {
                        Ok(b) => b,
                        Err(e) => {
                            warn!("Spilled fragment {} unreadable: {}", path.display(), e);
                            read_failure = Some(Err(Failure::Aborted(e.to_string())));
                            break;
                        }
                    },
                };
                delivered += data.len() as u64;
                open = delivery.tx.send(ClientEvent::Data(data)).is_ok();
            }

            let end = read_failure.or(delivery.end);
            let finished = end.is_some();
            if let Some(end) = end {
                if open {
                    open = delivery.tx.send(ClientEvent::End(end)).is_ok();
                }
            }

            let mut inner = self.inner.lock();
            if inner.generation != generation {
                break;
            }
            let Some(index) = inner.clients.iter().position(|c| c.id == delivery.id) else {
                continue;
            };
            if !open && inner.clients[index].shadow {
                inner.clients.remove(index);
                continue;
            }
            let slot = &mut inner.clients[index];
            slot.responded |= sent_head;
            slot.next = delivery.next;
            slot.delivered += delivered;
            slot.finished |= finished || !open;
        }
    }

    async fn read_spilled(&self, path: &std::path::Path) -> std::io::Result<Bytes> {
        match &self.store {
            Some(store) => store.read_fragment(path).await,
            None => Err(std::io::Error::other("no spill store")),
        }
    }

    /// Move fragments every client has moved past to disk. With `finalize`,
    /// the trailing partial fragment goes too.
    pub async fn offload(&self, finalize: bool) {
        let Some(store) = &self.store else {
            return;
        };

        let (generation, head, jobs) = {
            let mut inner = self.inner.lock();
            if inner.kind == MediaKind::Meta || inner.destroyed {
                return;
            }
            let min_next = inner
                .clients
                .iter()
                .filter(|c| !c.finished)
                .map(|c| c.next)
                .min()
                .unwrap_or(inner.fragments.len())
                .min(inner.fragments.len());
            let ended = inner.outcome.is_some();
            let jobs: Vec<(usize, Bytes)> = inner.fragments[..min_next]
                .iter()
                .enumerate()
                .filter_map(|(i, f)| match f {
                    Fragment::Memory(b) if b.len() >= self.fragment_size || (finalize && ended) => {
                        Some((i, b.clone()))
                    }
                    _ => None,
                })
                .collect();
            let head = if !jobs.is_empty() && !inner.headers_written {
                inner.headers_written = true;
                inner.head.clone()
            } else {
                None
            };
            (inner.generation, head, jobs)
        };

        if let Some(head) = head {
            let sidecar = HeadersSidecar {
                status: head.status,
                headers: head
                    .headers
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                    .collect(),
            };
            if let Err(e) = store.write_headers(&self.stem, &sidecar).await {
                warn!("Failed to write headers for {}: {}", self.url, e);
            }
        }

        for (index, data) in jobs {
            let path = store.fragment_path(&self.stem, generation, index);
            if let Err(e) = store.write_fragment(&path, &data).await {
                warn!("Failed to spill {}: {}", path.display(), e);
                return;
            }
            let kept = {
                let mut inner = self.inner.lock();
                let current = inner.generation == generation
                    && !inner.destroyed
                    && matches!(inner.fragments.get(index), Some(Fragment::Memory(_)));
                if current {
                    inner.fragments[index] = Fragment::Spilled {
                        path: path.clone(),
                        size: data.len(),
                    };
                }
                current
            };
            if !kept {
                store.discard(&path).await;
            }
        }
    }

    /// Stop the fetch, end every client and remove spilled files.
    pub async fn destroy(&self) {
        let (fetch, spilled) = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            for client in inner.clients.iter_mut().filter(|c| !c.finished) {
                let _ = client.tx.send(ClientEvent::End(Err(Failure::Cancelled)));
                client.finished = true;
            }
            inner.open.clear();
            (inner.fetch.take(), take_spilled(&mut inner.fragments))
        };
        if let Some(fetch) = fetch {
            fetch.cancel();
        }
        if let Some(store) = &self.store {
            for path in spilled {
                store.discard(&path).await;
            }
            store.discard(&store.headers_path(&self.stem)).await;
        }
        debug!("Destroyed {}", self.url);
    }

    fn discard_later(&self, paths: Vec<PathBuf>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if paths.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for path in paths {
                    store.discard(&path).await;
                }
            });
        }
    }
}

fn take_spilled(fragments: &mut Vec<Fragment>) -> Vec<PathBuf> {
    fragments
        .drain(..)
        .filter_map(|f| match f {
            Fragment::Spilled { path, .. } => Some(path),
            Fragment::Memory(_) => None,
        })
        .collect()
}

/// One logical consumer of a multiplexer.
pub struct ClientHandle {
    id: u64,
    shadow: bool,
    mux: Option<Arc<RequestMultiplexer>>,
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    done: bool,
}

impl ClientHandle {
    /// A response decided locally, with no body and no upstream fetch.
    pub fn immediate(head: ResponseHead) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ClientEvent::Head(head));
        let _ = tx.send(ClientEvent::End(Ok(())));
        Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            shadow: false,
            mux: None,
            rx,
            done: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow
    }

    pub fn multiplexer(&self) -> Option<&Arc<RequestMultiplexer>> {
        self.mux.as_ref()
    }

    /// Wait for the response head.
    pub async fn response(&mut self) -> Result<ResponseHead, Failure> {
        loop {
            match self.rx.recv().await {
                Some(ClientEvent::Head(head)) => return Ok(head),
                Some(ClientEvent::Data(_)) => continue,
                Some(ClientEvent::End(Err(f))) => {
                    self.done = true;
                    return Err(f);
                }
                Some(ClientEvent::End(Ok(()))) | None => {
                    self.done = true;
                    return Err(Failure::Aborted("closed before response".to_string()));
                }
            }
        }
    }

    /// Body bytes as they arrive. Dropping the stream detaches the client.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        stream::unfold(self, |mut client| async move {
            if client.done {
                return None;
            }
            loop {
                match client.rx.recv().await {
                    Some(ClientEvent::Data(b)) => return Some((Ok(b), client)),
                    Some(ClientEvent::Head(_)) => continue,
                    Some(ClientEvent::End(Ok(()))) | None => return None,
                    Some(ClientEvent::End(Err(f))) => {
                        client.done = true;
                        return Some((Err(std::io::Error::other(f)), client));
                    }
                }
            }
        })
    }

    /// Collect the remaining body.
    pub async fn read_to_end(mut self) -> Result<Bytes, Failure> {
        let mut out = BytesMut::new();
        if self.done {
            return Ok(out.freeze());
        }
        loop {
            match self.rx.recv().await {
                Some(ClientEvent::Data(b)) => out.extend_from_slice(&b),
                Some(ClientEvent::Head(_)) => {}
                Some(ClientEvent::End(Ok(()))) | None => return Ok(out.freeze()),
                Some(ClientEvent::End(Err(f))) => return Err(f),
            }
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.shadow {
            return;
        }
        if let Some(mux) = &self.mux {
            mux.remove_client(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    const URL: &str = "http://cdn.example.com/live/seg1.ts";

    fn head(status: u16) -> ResponseHead {
        ResponseHead::new(status, HeaderMap::new(), URL)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn fragments_account_for_every_byte() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 10, None);
        mux.write(&payload(7));
        mux.write(&payload(18));
        assert_eq!(mux.bytes_written(), 25);
        assert_eq!(mux.fragment_count(), 3);

        mux.end(Ok(()));
        assert_eq!(mux.content_length(), Some(25));
        assert_eq!(mux.body().unwrap().len(), 25);

        // no writes once ended
        mux.write(b"late");
        assert_eq!(mux.bytes_written(), 25);
    }

    #[tokio::test]
    async fn partial_fragment_held_until_end() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 10, None);
        let mut client = mux.add_client(false);
        mux.respond(head(200));
        mux.write(&payload(15));
        mux.pump().await;

        assert_eq!(client.response().await.unwrap().status, 200);
        assert_eq!(mux.delivered_to(client.id()), Some(10));

        mux.end(Ok(()));
        mux.pump().await;
        assert_eq!(mux.delivered_to(client.id()), Some(15));
        assert_eq!(client.read_to_end().await.unwrap().len(), 15);
    }

    #[tokio::test]
    async fn every_client_gets_identical_bytes() {
        let data = payload(1000);
        for n in [1usize, 3, 8] {
            let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 64, None);
            let clients: Vec<ClientHandle> = (0..n).map(|_| mux.add_client(false)).collect();
            mux.respond(head(200));
            for chunk in data.chunks(37) {
                mux.write(chunk);
                mux.pump().await;
            }
            mux.end(Ok(()));
            mux.pump().await;

            for client in clients {
                assert_eq!(&client.read_to_end().await.unwrap()[..], &data[..]);
            }
        }
    }

    #[tokio::test]
    async fn concurrent_pumps_do_not_duplicate() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 16, None);
        let client = mux.add_client(false);
        mux.respond(head(200));
        mux.write(&payload(160));
        mux.end(Ok(()));

        let pumps = (0..10).map(|_| mux.pump());
        futures_util::future::join_all(pumps).await;
        mux.pump().await;

        assert_eq!(client.read_to_end().await.unwrap().len(), 160);
    }

    #[tokio::test]
    async fn nothing_flows_before_respond() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Meta, 16, None);
        let client = mux.add_client(false);
        mux.write(b"#EXTM3U\n");
        mux.pump().await;
        assert_eq!(mux.delivered_to(client.id()), Some(0));

        mux.replace_body(Bytes::from_static(b"#EXTM3U\n#EXT-X-ENDLIST\n"));
        mux.respond(head(200));
        mux.end(Ok(()));
        mux.pump().await;
        assert_eq!(
            &client.read_to_end().await.unwrap()[..],
            b"#EXTM3U\n#EXT-X-ENDLIST\n"
        );
    }

    #[tokio::test]
    async fn failure_without_head_reaches_clients() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 16, None);
        let mut client = mux.add_client(false);
        mux.end(Err(Failure::Timeout(URL.to_string())));
        mux.pump().await;
        assert_eq!(
            client.response().await.unwrap_err(),
            Failure::Timeout(URL.to_string())
        );
    }

    #[tokio::test]
    async fn client_drop_detaches_only_real_clients() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 16, None);
        let real = mux.add_client(false);
        let shadow = mux.add_client(true);
        assert_eq!(mux.client_count(), 2);

        drop(real);
        assert_eq!(mux.client_count(), 1);
        assert!(!mux.has_real_clients());

        // the shadow goes away once a delivery finds nobody listening
        drop(shadow);
        mux.respond(head(200));
        mux.pump().await;
        assert_eq!(mux.client_count(), 0);
    }

    #[tokio::test]
    async fn manifests_expire() {
        let mux = RequestMultiplexer::new("http://o/live.m3u8", MediaKind::Meta, 16, None);
        assert!(!mux.expired());
        mux.inner.lock().created_at = Instant::now() - Duration::from_secs(3);
        assert!(mux.expired());

        mux.reset(MediaKind::Meta);
        assert!(!mux.expired());

        let segment = RequestMultiplexer::new(URL, MediaKind::Segment, 16, None);
        segment.inner.lock().created_at = Instant::now() - Duration::from_secs(3);
        assert!(!segment.expired());
    }

    #[tokio::test]
    async fn spilled_fragments_serve_late_clients() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(SpillStore::create(root.path()).unwrap());
        let data = payload(100);

        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 32, Some(store.clone()));
        mux.respond(head(200));
        mux.write(&data);
        mux.end(Ok(()));
        mux.pump().await;

        // no clients, so everything went to disk
        assert!(mux.body().is_none());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 5);

        let late = mux.add_client(false);
        mux.pump().await;
        assert_eq!(&late.read_to_end().await.unwrap()[..], &data[..]);

        mux.destroy().await;
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn spilled_resources_with_similar_urls_stay_apart() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(SpillStore::create(root.path()).unwrap());

        let plain = "http://h.tv/a/b.ts";
        let secure = "https://h.tv/a_b.ts";
        let first = RequestMultiplexer::new(plain, MediaKind::Segment, 4, Some(store.clone()));
        let second = RequestMultiplexer::new(secure, MediaKind::Segment, 4, Some(store.clone()));
        for (mux, body) in [(&first, b"AAAAAAAA"), (&second, b"BBBBBBBB")] {
            mux.respond(ResponseHead::new(200, HeaderMap::new(), mux.url()));
            mux.write(body);
            mux.end(Ok(()));
            mux.pump().await;
            assert!(mux.body().is_none());
        }

        let late = first.add_client(false);
        first.pump().await;
        assert_eq!(&late.read_to_end().await.unwrap()[..], b"AAAAAAAA");

        // tearing one down leaves the other's files alone
        first.destroy().await;
        let late = second.add_client(false);
        second.pump().await;
        assert_eq!(&late.read_to_end().await.unwrap()[..], b"BBBBBBBB");
        assert!(store.headers_path(&SpillStore::file_stem(secure)).exists());
    }

    #[tokio::test]
    async fn destroy_ends_waiting_clients() {
        let mux = RequestMultiplexer::new(URL, MediaKind::Segment, 16, None);
        let mut client = mux.add_client(false);
        mux.destroy().await;
        assert!(mux.is_destroyed());
        assert_eq!(client.response().await.unwrap_err(), Failure::Cancelled);
    }
}
