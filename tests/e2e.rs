//! End-to-end tests for the hlsmux proxy
//!
//! Starts a real Axum server on a random port in front of a wiremock origin
//! and drives it with a plain HTTP client, the way a player would.
//!
//! The listener is bound first so that proxified URLs in rewritten manifests
//! carry the real port and can be followed by the client.

use hlsmux::config::Config;
use hlsmux::registry::ResourceRequest;
use hlsmux::server::{build_router, state::AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Test server helpers ───────────────────────────────────────────────────────

struct TestProxy {
    addr: SocketAddr,
    state: AppState,
    _cache: TempDir,
}

impl TestProxy {
    fn url(&self, origin: &MockServer, p: &str) -> String {
        format!("http://{}/{}{}", self.addr, origin.address(), p)
    }
}

async fn start_proxy(config: Config) -> TestProxy {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();

    let cache = TempDir::new().unwrap();
    let config = Config {
        cache_dir: cache.path().to_path_buf(),
        fetch_retries: 0,
        ..config
    };
    let state = AppState::new(config, addr).unwrap();
    let app = build_router(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestProxy {
        addr,
        state,
        _cache: cache,
    }
}

fn media_playlist(sequence: usize, segments: std::ops::Range<usize>) -> String {
    let mut body = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        sequence
    );
    for n in segments {
        body.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", n));
    }
    body
}

async fn mount_playlist(origin: &MockServer, p: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(p))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/vnd.apple.mpegurl")
                .set_body_string(body),
        )
        .mount(origin)
        .await;
}

fn segment_bytes(n: usize) -> Vec<u8> {
    let mut data = vec![0x47u8; 188 * 20];
    data[1] = n as u8;
    data
}

async fn requests_for(origin: &MockServer, p: &str) -> usize {
    origin
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == p)
        .count()
}

// ── Playback ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn player_follows_rewritten_urls_from_master_to_segment() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1500000\nhd/index.m3u8\n",
        ))
        .mount(&origin)
        .await;
    mount_playlist(&origin, "/live/hd/index.m3u8", media_playlist(1, 1..4)).await;
    Mock::given(method("GET"))
        .and(path("/live/hd/seg2.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(segment_bytes(2)))
        .mount(&origin)
        .await;

    let proxy = start_proxy(Config {
        prefetch_enabled: false,
        ..Config::default()
    })
    .await;
    let client = reqwest::Client::new();

    let master = client
        .get(proxy.url(&origin, "/live/master.m3u8"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let variant = master
        .lines()
        .find(|l| l.starts_with("http://"))
        .expect("proxified variant URL")
        .to_string();
    assert_eq!(variant, proxy.url(&origin, "/live/hd/index.m3u8"));

    let playlist = client.get(&variant).send().await.unwrap().text().await.unwrap();
    let segment = playlist
        .lines()
        .find(|l| l.ends_with("seg2.ts"))
        .expect("proxified segment URL")
        .to_string();

    let resp = client.get(&segment).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap()),
        Some("*")
    );
    assert_eq!(resp.bytes().await.unwrap().to_vec(), segment_bytes(2));
    assert_eq!(proxy.state.registry.current_bitrate(), Some(1_500_000));
}

#[tokio::test]
async fn concurrent_clients_share_one_upstream_fetch() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/seg7.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(200))
                .set_body_bytes(segment_bytes(7)),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let proxy = start_proxy(Config {
        prefetch_enabled: false,
        ..Config::default()
    })
    .await;
    let url = proxy.url(&origin, "/live/seg7.ts");
    let upstream = format!("http://{}/live/seg7.ts", origin.address());

    // two prefetch pulls and one player request
    let _a = proxy
        .state
        .registry
        .download(ResourceRequest::shadow(upstream.clone()))
        .unwrap();
    let _b = proxy
        .state
        .registry
        .download(ResourceRequest::shadow(upstream))
        .unwrap();
    let body = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(body.to_vec(), segment_bytes(7));

    let client = reqwest::Client::new();
    let gets = (0..3).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move { client.get(&url).send().await.unwrap().bytes().await.unwrap() }
    });
    for body in futures_util::future::join_all(gets).await {
        assert_eq!(body.to_vec(), segment_bytes(7));
    }
    assert_eq!(requests_for(&origin, "/live/seg7.ts").await, 1);
}

#[tokio::test]
async fn missing_segment_leaves_live_window() {
    let origin = MockServer::start().await;
    mount_playlist(&origin, "/live/index.m3u8", media_playlist(1, 1..6)).await;
    Mock::given(method("GET"))
        .and(path("/live/seg3.ts"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;

    let proxy = start_proxy(Config {
        prefetch_enabled: false,
        ..Config::default()
    })
    .await;
    let manifest = proxy.url(&origin, "/live/index.m3u8");
    let upstream_manifest = format!("http://{}/live/index.m3u8", origin.address());

    reqwest::get(&manifest).await.unwrap().text().await.unwrap();
    let resp = reqwest::get(proxy.url(&origin, "/live/seg3.ts")).await.unwrap();
    assert_eq!(resp.status(), 204);
    assert!(resp.bytes().await.unwrap().is_empty());

    // the origin keeps listing seg3 in later refreshes
    tokio::time::sleep(hlsmux::multiplexer::META_TTL + Duration::from_millis(200)).await;
    reqwest::get(&manifest).await.unwrap().text().await.unwrap();
    assert_eq!(requests_for(&origin, "/live/index.m3u8").await, 2);

    let registry = &proxy.state.registry;
    assert_eq!(
        registry.with_journal(&upstream_manifest, |j| j.in_live_window("seg3.ts")),
        Some(false)
    );
    assert_eq!(
        registry.with_journal(&upstream_manifest, |j| j.in_live_window("seg4.ts")),
        Some(true)
    );
}

#[tokio::test]
async fn next_segment_is_prefetched_before_the_player_asks() {
    let origin = MockServer::start().await;
    mount_playlist(&origin, "/live/index.m3u8", media_playlist(10, 10..14)).await;
    for n in 10..14 {
        Mock::given(method("GET"))
            .and(path(format!("/live/seg{}.ts", n)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(segment_bytes(n)))
            .mount(&origin)
            .await;
    }

    let proxy = start_proxy(Config::default()).await;
    reqwest::get(proxy.url(&origin, "/live/index.m3u8"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    reqwest::get(proxy.url(&origin, "/live/seg10.ts"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(requests_for(&origin, "/live/seg11.ts").await, 1);

    let body = reqwest::get(proxy.url(&origin, "/live/seg11.ts"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.to_vec(), segment_bytes(11));
    assert_eq!(requests_for(&origin, "/live/seg11.ts").await, 1);
}

#[tokio::test]
async fn timed_out_fetch_aborts_without_a_reply() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/slow.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_bytes(segment_bytes(1)),
        )
        .mount(&origin)
        .await;

    let proxy = start_proxy(Config {
        prefetch_enabled: false,
        fetch_timeout_secs: 1,
        ..Config::default()
    })
    .await;

    match reqwest::get(proxy.url(&origin, "/live/slow.ts")).await {
        Err(_) => {}
        Ok(resp) => assert!(resp.bytes().await.is_err(), "got a complete reply"),
    }
}

#[tokio::test]
async fn favicon_is_not_proxied() {
    let proxy = start_proxy(Config::default()).await;
    let resp = reqwest::get(format!("http://{}/favicon.ico", proxy.addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
