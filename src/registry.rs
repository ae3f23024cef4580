//! In-flight and cached upstream resources, keyed by upstream URL.
//!
//! The registry decides whether a request attaches to an existing
//! multiplexer or starts a new fetch, translates origin statuses, feeds
//! finished manifests to the rewriter and their journals, and runs the
//! cross-resource policies: obsolete-segment cancellation, one-ahead
//! prefetch and disk-budget eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SpillStore;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::hls::journal::Journal;
use crate::hls::mirrors::MirrorSet;
use crate::hls::parser::{self, ManifestKind};
use crate::hls::rewrite::ManifestRewriter;
use crate::metrics;
use crate::multiplexer::{ClientHandle, Failure, MediaKind, Outcome, RequestMultiplexer};
use crate::server::proxy_url::ProxyUrls;
use crate::upstream::{
    FailureSink, FetchEvent, FetchHandle, FetchOptions, ResponseHead, Transport, UpstreamFetch,
};

/// Minimum spacing between opportunistic cleans.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(30);

/// Eviction always leaves this many candidates resident.
pub const KEEP_RESIDENT: usize = 6;

const PREFETCH_DELAY: Duration = Duration::from_millis(50);

/// Share of free disk space used as the budget once measured.
const FREE_SPACE_SHARE: u64 = 5;

/// A request for one upstream resource.
#[derive(Clone, Debug)]
pub struct ResourceRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Prefetch pull with no real consumer
    pub shadow: bool,
}

impl ResourceRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            shadow: false,
        }
    }

    pub fn shadow(url: impl Into<String>) -> Self {
        Self {
            shadow: true,
            ..Self::new(url)
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Default)]
struct Maps {
    /// Every key here also has a `cache` entry
    active: HashMap<String, FetchHandle>,
    cache: HashMap<String, Arc<RequestMultiplexer>>,
}

struct Shared {
    config: Arc<Config>,
    urls: ProxyUrls,
    rewriter: ManifestRewriter,
    transport: Arc<dyn Transport>,
    store: Option<Arc<SpillStore>>,
    sink: Arc<dyn FailureSink>,
    maps: Mutex<Maps>,
    journals: DashMap<String, Journal>,
    mirrors: MirrorSet,
    /// Advertised bitrate per variant playlist URL
    bitrates: DashMap<String, u64>,
    current_bitrate: AtomicU64,
    /// Bytes per second of the last completed segment
    download_speed: AtomicU64,
    active_manifest: Mutex<Option<String>>,
    current_segment: Mutex<Option<String>>,
    prefetch_concurrency: AtomicUsize,
    disk_budget: AtomicU64,
    last_clean: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct RequestRegistry {
    shared: Arc<Shared>,
}

impl RequestRegistry {
    pub fn new(
        config: Arc<Config>,
        urls: ProxyUrls,
        transport: Arc<dyn Transport>,
        store: Option<Arc<SpillStore>>,
        sink: Arc<dyn FailureSink>,
    ) -> Self {
        let registry = Self {
            shared: Arc::new(Shared {
                rewriter: ManifestRewriter::new(urls.clone()),
                urls,
                transport,
                store,
                sink,
                maps: Mutex::new(Maps::default()),
                journals: DashMap::new(),
                mirrors: MirrorSet::new(),
                bitrates: DashMap::new(),
                current_bitrate: AtomicU64::new(0),
                download_speed: AtomicU64::new(0),
                active_manifest: Mutex::new(None),
                current_segment: Mutex::new(None),
                prefetch_concurrency: AtomicUsize::new(config.prefetch_max_concurrency),
                disk_budget: AtomicU64::new(config.disk_budget_bytes),
                last_clean: Mutex::new(None),
                cancel: CancellationToken::new(),
                config,
            }),
        };
        registry.spawn_maintenance();
        registry
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn urls(&self) -> &ProxyUrls {
        &self.shared.urls
    }

    pub fn mirrors(&self) -> &MirrorSet {
        &self.shared.mirrors
    }

    /// Bitrate of the variant playlist fetched last, when its master
    /// advertised one.
    pub fn current_bitrate(&self) -> Option<u64> {
        match self.shared.current_bitrate.load(Ordering::Relaxed) {
            0 => None,
            bps => Some(bps),
        }
    }

    pub fn download_speed(&self) -> Option<u64> {
        match self.shared.download_speed.load(Ordering::Relaxed) {
            0 => None,
            bps => Some(bps),
        }
    }

    pub fn prefetch_concurrency(&self) -> usize {
        self.shared.prefetch_concurrency.load(Ordering::Relaxed)
    }

    pub fn disk_budget(&self) -> u64 {
        self.shared.disk_budget.load(Ordering::Relaxed)
    }

    pub fn set_disk_budget(&self, bytes: u64) {
        self.shared.disk_budget.store(bytes, Ordering::Relaxed);
    }

    pub fn active_manifest(&self) -> Option<String> {
        self.shared.active_manifest.lock().clone()
    }

    pub fn is_fetching(&self, url: &str) -> bool {
        self.shared.maps.lock().active.contains_key(url)
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.shared.maps.lock().cache.contains_key(url)
    }

    pub fn active_fetch_count(&self) -> usize {
        self.shared.maps.lock().active.len()
    }

    pub fn cached_count(&self) -> usize {
        self.shared.maps.lock().cache.len()
    }

    /// Run `f` against the journal of a media playlist.
    pub fn with_journal<R>(&self, manifest_url: &str, f: impl FnOnce(&Journal) -> R) -> Option<R> {
        self.shared.journals.get(manifest_url).map(|j| f(j.value()))
    }

    /// Estimated bytes held, counting every fragment as full.
    pub fn disk_usage(&self) -> u64 {
        let maps = self.shared.maps.lock();
        usage_of(&maps, self.shared.config.fragment_size)
    }

    /// Attach to an existing fetch or cached response, or start a new fetch.
    pub fn download(&self, request: ResourceRequest) -> Result<ClientHandle> {
        if self.shared.cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let url = request.url;
        if !request.shadow && MediaKind::from_url(&url) == MediaKind::Segment {
            *self.shared.current_segment.lock() = Some(url.clone());
        }

        let (mux, client, fetch, events) = {
            let mut maps = self.shared.maps.lock();

            if let Some(mux) = maps.cache.get(&url).cloned() {
                let fetching = maps.active.contains_key(&url);
                if !mux.is_destroyed() && (fetching || !(mux.expired() || mux.failed())) {
                    debug!("Attaching to {} (fetching: {})", url, fetching);
                    return Ok(mux.add_client(request.shadow));
                }
            }

            if self.is_stale(&url) {
                debug!("Refusing segment outside live window: {}", url);
                return Ok(ClientHandle::immediate(ResponseHead::new(
                    204,
                    HeaderMap::new(),
                    url,
                )));
            }

            let kind = MediaKind::from_url(&url);
            let existing = maps
                .cache
                .get(&url)
                .filter(|m| !m.is_destroyed())
                .cloned();
            let mux = match existing {
                Some(existing) => {
                    existing.reset(kind);
                    existing
                }
                None => {
                    let mux = RequestMultiplexer::new(
                        url.clone(),
                        kind,
                        self.shared.config.fragment_size,
                        self.shared.store.clone(),
                    );
                    maps.cache.insert(url.clone(), mux.clone());
                    mux
                }
            };
            let client = mux.add_client(request.shadow);

            let opts =
                FetchOptions::from_config(url.clone(), &self.shared.config).with_headers(request.headers);
            let (fetch, events) = UpstreamFetch::start(self.shared.transport.clone(), opts);
            mux.set_fetch(fetch.clone());
            maps.active.insert(url.clone(), fetch.clone());
            (mux, client, fetch, events)
        };

        debug!("Fetching {} (shadow: {})", url, request.shadow);
        metrics::record_upstream_fetch();
        tokio::spawn(self.clone().drive(mux, fetch, events));
        self.auto_clean();
        Ok(client)
    }

    /// Segments a journal knows about but no live window lists anymore.
    /// URLs no journal has seen are never stale.
    fn is_stale(&self, url: &str) -> bool {
        if !self.shared.config.finish_outside_live_window || !parser::is_segment_url(url) {
            return false;
        }
        let mut known = false;
        for journal in self.shared.journals.iter() {
            if journal.contains(url) {
                known = true;
                if journal.in_live_window(url) {
                    return false;
                }
            }
        }
        known
    }

    async fn drive(
        self,
        mux: Arc<RequestMultiplexer>,
        fetch: FetchHandle,
        mut events: mpsc::Receiver<FetchEvent>,
    ) {
        let started = Instant::now();
        let mut held: Option<ResponseHead> = None;
        let mut discard = false;
        let mut received = 0usize;
        let mut outcome: Outcome = Err(Failure::Aborted("fetch stopped".to_string()));

        while let Some(event) = events.recv().await {
            match event {
                FetchEvent::Response(head) => {
                    let head = self.translate(&mux, head, &mut discard);
                    if (200..300).contains(&head.status)
                        && parser::is_manifest(head.content_type(), mux.url())
                    {
                        mux.set_kind(MediaKind::Meta);
                        held = Some(head);
                    } else {
                        mux.respond(head);
                        mux.pump().await;
                    }
                }
                FetchEvent::Data(chunk) => {
                    received += chunk.len();
                    metrics::record_upstream_bytes(chunk.len());
                    if !discard {
                        mux.write(&chunk);
                        if held.is_none() {
                            mux.pump().await;
                        }
                    }
                }
                FetchEvent::End(result) => {
                    outcome = match result {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            if !matches!(e, ProxyError::Cancelled) {
                                self.shared.sink.connection_failure(e.status_code());
                            }
                            Err(Failure::from_error(&e))
                        }
                    };
                    break;
                }
            }
        }

        self.finish(mux, fetch, held, outcome, received, started)
            .await;
    }

    /// Apply the status translation policy to an origin response.
    fn translate(
        &self,
        mux: &RequestMultiplexer,
        mut head: ResponseHead,
        discard: &mut bool,
    ) -> ResponseHead {
        let url = mux.url();
        if head.status == 410 {
            head.status = 404;
        }

        if head.status == 403 {
            let previous = self
                .shared
                .prefetch_concurrency
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
            warn!(
                "HTTP 403 from {}, prefetch concurrency now {}",
                url,
                previous.map(|c| c - 1).unwrap_or(0)
            );
        }

        if head.status == 404 && mux.kind() == MediaKind::Segment {
            for mut journal in self.shared.journals.iter_mut() {
                if journal.contains(url) {
                    journal.report_404(url);
                }
            }
            debug!("Segment 404 served as 204: {}", url);
            *discard = true;
            return ResponseHead::new(204, HeaderMap::new(), head.final_url);
        }

        head
    }

    async fn finish(
        &self,
        mux: Arc<RequestMultiplexer>,
        fetch: FetchHandle,
        held: Option<ResponseHead>,
        outcome: Outcome,
        received: usize,
        started: Instant,
    ) {
        let url = mux.url().to_string();
        {
            let mut maps = self.shared.maps.lock();
            if maps.active.get(&url).is_some_and(|h| h.id() == fetch.id()) {
                maps.active.remove(&url);
            }
        }

        if let Some(head) = held {
            if outcome.is_ok() {
                self.complete_manifest(&mux, head);
            }
        }

        let kind = mux.kind();
        mux.end(outcome.clone());
        mux.pump().await;

        if outcome.is_err() {
            return;
        }

        if kind == MediaKind::Segment {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 && received > 0 {
                let speed = (received as f64 / elapsed) as u64;
                self.shared.download_speed.store(speed, Ordering::Relaxed);
                debug!("Downloaded {} bytes in {:.2}s from {}", received, elapsed, url);
            }
        }

        let current = self.shared.current_segment.lock().clone();
        if let Some(current) = current {
            self.finish_obsolete(&current).await;
        }
        self.schedule_prefetch();
    }

    /// Rewrite a finished manifest, update journal, mirrors and bitrate,
    /// then release it to clients.
    fn complete_manifest(&self, mux: &RequestMultiplexer, mut head: ResponseHead) {
        let url = mux.url();
        let body = mux.body().unwrap_or_default();
        let text = String::from_utf8_lossy(&body);
        let rewritten = self.shared.rewriter.rewrite(&text, &head.final_url);

        match rewritten.kind {
            ManifestKind::Master => {
                self.shared.mirrors.record(
                    url,
                    rewritten
                        .variants
                        .iter()
                        .map(|v| (v.url.clone(), v.name.clone())),
                );
                for variant in &rewritten.variants {
                    if let Some(bitrate) = variant.bitrate {
                        self.shared.bitrates.insert(variant.url.clone(), bitrate);
                    }
                }
            }
            ManifestKind::Media => {
                let max_window = self.shared.config.max_window_size();
                self.shared
                    .journals
                    .entry(url.to_string())
                    .or_insert_with(|| Journal::new(url, self.shared.urls.clone(), max_window))
                    .process(&rewritten.body);

                if let Some(bitrate) = self.shared.bitrates.get(url).map(|b| *b) {
                    self.shared.current_bitrate.store(bitrate, Ordering::Relaxed);
                    metrics::set_bitrate(bitrate);
                }
                *self.shared.active_manifest.lock() = Some(url.to_string());
            }
        }

        mux.replace_body(Bytes::from(rewritten.body));
        head.headers.remove(CONTENT_LENGTH);
        mux.respond(head);
    }

    /// Cancel unfinished fetches of segments listed before `current` that
    /// no real client is waiting for.
    pub async fn finish_obsolete(&self, current: &str) {
        let before: Vec<String> = self
            .shared
            .journals
            .iter()
            .filter(|j| j.contains(current))
            .flat_map(|j| j.urls_before(current))
            .collect();
        if before.is_empty() {
            return;
        }

        let victims: Vec<Arc<RequestMultiplexer>> = {
            let mut maps = self.shared.maps.lock();
            let mut victims = Vec::new();
            for url in before {
                let idle = match maps.cache.get(&url) {
                    Some(mux) => !mux.has_real_clients(),
                    None => false,
                };
                if !idle {
                    continue;
                }
                let Some(fetch) = maps.active.remove(&url) else {
                    continue;
                };
                fetch.cancel();
                if let Some(mux) = maps.cache.remove(&url) {
                    victims.push(mux);
                }
            }
            victims
        };

        for mux in victims {
            info!("Cancelled obsolete segment {}", mux.url());
            mux.destroy().await;
        }
    }

    fn schedule_prefetch(&self) {
        if !self.shared.config.prefetch_enabled || self.shared.cancel.is_cancelled() {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PREFETCH_DELAY).await;
            registry.prefetch();
        });
    }

    /// Start a shadow download of the segment after the current one in the
    /// active playlist. Returns its URL when one was started.
    pub fn prefetch(&self) -> Option<String> {
        if !self.shared.config.prefetch_enabled || self.shared.cancel.is_cancelled() {
            return None;
        }
        let manifest = self.shared.active_manifest.lock().clone()?;
        let current = self.shared.current_segment.lock().clone()?;
        let next = self
            .shared
            .journals
            .get(&manifest)?
            .next_after(&current)?
            .to_string();

        {
            let maps = self.shared.maps.lock();
            if maps.active.len() >= self.prefetch_concurrency() || maps.cache.contains_key(&next) {
                return None;
            }
        }

        debug!("Prefetching {}", next);
        metrics::record_prefetch();
        match self.download(ResourceRequest::shadow(next.clone())) {
            Ok(_shadow) => Some(next),
            Err(e) => {
                warn!("Prefetch of {} failed: {}", next, e);
                None
            }
        }
    }

    /// Spawn a clean if the last one is at least [`CLEAN_INTERVAL`] old.
    pub fn auto_clean(&self) -> bool {
        {
            let mut last = self.shared.last_clean.lock();
            if last.is_some_and(|t| t.elapsed() < CLEAN_INTERVAL) {
                return false;
            }
            *last = Some(Instant::now());
        }
        let registry = self.clone();
        tokio::spawn(async move {
            registry.clean().await;
        });
        true
    }

    /// Evict idle entries, oldest first, once usage reaches the budget.
    /// Returns how many were evicted.
    pub async fn clean(&self) -> usize {
        let fragment_size = self.shared.config.fragment_size;
        let budget = self.disk_budget();

        let victims = {
            let mut guard = self.shared.maps.lock();
            let mut usage = usage_of(&guard, fragment_size);
            metrics::set_cache_disk_bytes(usage);
            if usage < budget {
                return 0;
            }

            let Maps { active, cache } = &mut *guard;
            let mut candidates: Vec<(Instant, String, u64)> = cache
                .iter()
                .filter(|(url, mux)| !active.contains_key(*url) && mux.client_count() == 0)
                .map(|(url, mux)| {
                    (
                        mux.created_at(),
                        url.clone(),
                        (mux.fragment_count() * fragment_size) as u64,
                    )
                })
                .collect();
            candidates.sort_by_key(|(created, _, _)| *created);

            let max_evict = candidates.len().saturating_sub(KEEP_RESIDENT);
            let target = budget / 10 * 9;
            let mut victims = Vec::new();
            for (_, url, size) in candidates.into_iter().take(max_evict) {
                if usage <= target {
                    break;
                }
                if let Some(mux) = cache.remove(&url) {
                    usage = usage.saturating_sub(size);
                    victims.push(mux);
                }
            }
            metrics::set_cache_disk_bytes(usage);
            victims
        };

        let evicted = victims.len();
        for mux in victims {
            mux.destroy().await;
        }
        if evicted > 0 {
            info!("Evicted {} cached responses", evicted);
            metrics::record_eviction(evicted);
        }
        evicted
    }

    fn spawn_maintenance(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();

        runtime.spawn(async move {
            if let Some(shared) = weak.upgrade() {
                RequestRegistry { shared }.measure_disk_budget().await;
            }

            let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        RequestRegistry { shared }.auto_clean();
                    }
                }
            }
            debug!("Registry maintenance stopped");
        });
    }

    async fn measure_disk_budget(&self) {
        let Some(store) = self.shared.store.clone() else {
            return;
        };
        let free = tokio::task::spawn_blocking(move || store.available_space()).await;
        match free {
            Ok(Some(free)) if free > 0 => {
                let budget = free / FREE_SPACE_SHARE;
                info!("Disk budget set to {} MB", budget / (1024 * 1024));
                self.set_disk_budget(budget);
            }
            Ok(_) => debug!("Free disk space unknown, keeping configured budget"),
            Err(e) => warn!("Disk space measurement failed: {}", e),
        }
    }

    /// Cancel every fetch, destroy every response and remove the scratch
    /// directory.
    pub async fn destroy(&self) {
        self.shared.cancel.cancel();
        let (fetches, muxes) = {
            let mut maps = self.shared.maps.lock();
            let fetches: Vec<FetchHandle> = maps.active.drain().map(|(_, f)| f).collect();
            let muxes: Vec<Arc<RequestMultiplexer>> = maps.cache.drain().map(|(_, m)| m).collect();
            (fetches, muxes)
        };
        for fetch in fetches {
            fetch.cancel();
        }
        for mux in muxes {
            mux.destroy().await;
        }
        if let Some(store) = &self.shared.store {
            store.purge();
        }
        info!("Registry destroyed");
    }
}

fn usage_of(maps: &Maps, fragment_size: usize) -> u64 {
    maps.cache
        .values()
        .map(|m| (m.fragment_count() * fragment_size) as u64)
        .sum()
}
