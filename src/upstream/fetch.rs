//! One upstream download, modelled as a small state machine.
//!
//! [`UpstreamFetch::start`] spawns a task that walks
//! `Idle -> Connecting -> Streaming -> Ended | Failed` and reports progress
//! on a channel: one [`FetchEvent::Response`], any number of
//! [`FetchEvent::Data`], then exactly one [`FetchEvent::End`]. The network
//! side sits behind the [`Transport`] trait so the registry can be driven by
//! scripted origins in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::Client;
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::http_retry::{DEFAULT_BACKOFF_MS, RetryConfig, send_with_retry};

/// Events buffered between the fetch task and its consumer.
const EVENT_BUFFER: usize = 32;

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a single fetch needs to know.
#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub url: String,
    /// Extra request headers, already filtered by the caller
    pub headers: HeaderMap,
    pub keepalive: bool,
    pub follow_redirect: bool,
    /// Retries after the first attempt
    pub retries: u32,
    /// Visited once when the origin answers 401/403
    pub auth_url: Option<String>,
    pub timeout: Duration,
}

impl FetchOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            keepalive: true,
            follow_redirect: true,
            retries: 3,
            auth_url: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(url: impl Into<String>, config: &Config) -> Self {
        Self {
            keepalive: config.keepalive,
            follow_redirect: config.follow_redirect,
            retries: config.fetch_retries,
            auth_url: config.auth_url.clone(),
            timeout: config.fetch_timeout(),
            ..Self::new(url)
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Status line and headers of an upstream response.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
    /// URL after redirects
    pub final_url: String,
}

impl ResponseHead {
    pub fn new(status: u16, headers: HeaderMap, final_url: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            final_url: final_url.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

pub struct UpstreamResponse {
    pub head: ResponseHead,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Opens connections to the origin.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, opts: &FetchOptions) -> Result<UpstreamResponse>;
}

/// Map a reqwest error, keeping timeouts distinct.
fn classify(err: reqwest::Error, url: &str) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout(url.to_string())
    } else {
        ProxyError::Upstream(err)
    }
}

/// [`Transport`] backed by reqwest, with retries from [`send_with_retry`].
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    no_redirect: Client,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let builder = || {
            Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .pool_max_idle_per_host(10)
                .connect_timeout(config.connect_timeout())
                .cookie_store(true)
        };

        let client = builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let no_redirect = builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            no_redirect,
        })
    }

    async fn send(&self, opts: &FetchOptions) -> Result<reqwest::Response> {
        let client = if opts.follow_redirect {
            &self.client
        } else {
            &self.no_redirect
        };
        let retry = RetryConfig {
            max_attempts: opts.retries.saturating_add(1),
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Some(opts.timeout),
        };

        send_with_retry(&opts.url, &retry, || {
            let mut request = client.get(&opts.url).headers(opts.headers.clone());
            if !opts.keepalive {
                request = request.header(CONNECTION, HeaderValue::from_static("close"));
            }
            request
        })
        .await
        .map_err(|e| classify(e, &opts.url))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn open(&self, opts: &FetchOptions) -> Result<UpstreamResponse> {
        let mut response = self.send(opts).await?;

        let status = response.status().as_u16();
        if matches!(status, 401 | 403) {
            if let Some(auth_url) = &opts.auth_url {
                info!("Visiting auth URL after HTTP {} from {}", status, opts.url);
                match self.client.get(auth_url).send().await {
                    Ok(_) => response = self.send(opts).await?,
                    Err(e) => warn!("Auth URL {} failed: {}", auth_url, e),
                }
            }
        }

        let head = ResponseHead::new(
            response.status().as_u16(),
            response.headers().clone(),
            response.url().as_str(),
        );
        let url = opts.url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(e, &url)))
            .boxed();

        Ok(UpstreamResponse { head, body })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Connecting,
    Streaming,
    Ended,
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

#[derive(Debug)]
pub enum FetchEvent {
    Response(ResponseHead),
    Data(Bytes),
    /// Always the last event of a fetch
    End(Result<()>),
}

/// Cheap handle to a running fetch.
#[derive(Clone, Debug)]
pub struct FetchHandle {
    id: u64,
    url: String,
    state: watch::Receiver<FetchState>,
    cancel: CancellationToken,
}

impl FetchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> FetchState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Abort the fetch. Its consumer still receives a final `End`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for a terminal state.
    pub async fn finished(&self) -> FetchState {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        }
    }
}

pub struct UpstreamFetch;

impl UpstreamFetch {
    /// Spawn the fetch task and return its handle plus the event stream.
    pub fn start(
        transport: Arc<dyn Transport>,
        opts: FetchOptions,
    ) -> (FetchHandle, mpsc::Receiver<FetchEvent>) {
        let id = NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(FetchState::Idle);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let handle = FetchHandle {
            id,
            url: opts.url.clone(),
            state: state_rx,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            let result = run(transport.as_ref(), &opts, &state_tx, &tx, &cancel).await;
            match &result {
                Ok(()) => debug!("Fetch {} ended: {}", id, opts.url),
                Err(ProxyError::Cancelled) => debug!("Fetch {} cancelled: {}", id, opts.url),
                Err(e) => warn!("Fetch {} failed: {}", id, e),
            }
            let _ = state_tx.send(if result.is_ok() {
                FetchState::Ended
            } else {
                FetchState::Failed
            });
            let _ = tx.send(FetchEvent::End(result)).await;
        });

        (handle, rx)
    }
}

async fn run(
    transport: &dyn Transport,
    opts: &FetchOptions,
    state: &watch::Sender<FetchState>,
    tx: &mpsc::Sender<FetchEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let _ = state.send(FetchState::Connecting);

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        response = transport.open(opts) => response?,
    };

    let _ = state.send(FetchState::Streaming);
    if tx.send(FetchEvent::Response(response.head)).await.is_err() {
        return Err(ProxyError::Cancelled);
    }

    let mut body = response.body;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(data)) => {
                if tx.send(FetchEvent::Data(data)).await.is_err() {
                    return Err(ProxyError::Cancelled);
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
