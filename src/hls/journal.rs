//! Per-manifest segment history and live window.
//!
//! Every media manifest fetched through the proxy is fed to its journal.
//! The journal remembers the raw playlist lines of each segment it has seen
//! (bounded to twice the live window), the ordered set of segments the last
//! manifest advertised, and a media sequence number rewritten so that the
//! retained history and the live window read as one continuous playlist.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::server::proxy_url::ProxyUrls;

static PROTO_AND_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(https?://|//)[^/]+/").expect("valid regex"));

static SEGMENT_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^.*\.(m4s|mts|m2ts|ts)").expect("valid regex"));

static MEDIA_SEQUENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)EXT-X-MEDIA-SEQUENCE: *([0-9]+)").expect("valid regex"));

fn segment_name(urls: &ProxyUrls, url: &str) -> String {
    let upstream = urls.unproxify(url);
    let path = PROTO_AND_DOMAIN.replace(&upstream, "");
    match SEGMENT_PATH.find(&path) {
        Some(m) => m.as_str().to_string(),
        None => path.into_owned(),
    }
}

/// One segment as listed by the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Normalized name (path without scheme, host or query)
    pub name: String,
    /// Absolute upstream URL
    pub url: String,
    /// `#EXTINF` and the other tag lines attached to the segment, then its URI
    pub lines: String,
}

#[derive(Debug)]
pub struct Journal {
    url: String,
    urls: ProxyUrls,
    header: String,
    entries: Vec<SegmentRecord>,
    live_window: Vec<String>,
    dead: HashSet<String>,
    max_window_size: usize,
    media_sequence: Option<u64>,
}

impl Journal {
    pub fn new(url: impl Into<String>, urls: ProxyUrls, max_window_size: usize) -> Self {
        Self {
            url: url.into(),
            urls,
            header: String::new(),
            entries: Vec::new(),
            live_window: Vec::new(),
            dead: HashSet::new(),
            max_window_size: max_window_size.max(1),
            media_sequence: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Normalized segment name: proxy prefix, scheme, host and anything past
    /// the media extension are dropped.
    pub fn segment_name(&self, url: &str) -> String {
        segment_name(&self.urls, url)
    }

    /// Ingest a manifest body (already rewritten by the proxy).
    pub fn process(&mut self, body: &str) {
        if body.trim().is_empty() {
            return;
        }

        let mut header = Vec::new();
        let mut segments: Vec<SegmentRecord> = Vec::new();
        let mut pending: Option<String> = None;
        let mut tags_before_extinf: Vec<&str> = Vec::new();

        for line in body.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if line.starts_with("#EXTINF") {
                let mut block = tags_before_extinf.join("\n");
                if !block.is_empty() {
                    block.push('\n');
                }
                block.push_str(line);
                tags_before_extinf.clear();
                pending = Some(block);
            } else if let Some(block) = pending.as_mut() {
                block.push('\n');
                block.push_str(line);
                if !line.starts_with('#') {
                    let url = self.urls.unproxify(line);
                    let name = self.segment_name(&url);
                    let lines = pending.take().unwrap_or_default();
                    segments.push(SegmentRecord { name, url, lines });
                }
            } else if segments.is_empty() {
                header.push(line);
            } else if line.starts_with('#') {
                tags_before_extinf.push(line);
            }
        }

        // Names the origin no longer lists can be forgotten.
        self.dead
            .retain(|name| segments.iter().any(|s| &s.name == name));
        segments.retain(|s| !self.dead.contains(&s.name));

        self.live_window = segments.iter().map(|s| s.url.clone()).collect();

        for segment in &segments {
            match self.entries.iter_mut().find(|e| e.name == segment.name) {
                Some(existing) if *existing != *segment => *existing = segment.clone(),
                Some(_) => {}
                None => self.entries.push(segment.clone()),
            }
        }
        self.trim();

        self.header = header.join("\n");
        self.media_sequence = None;
        let Some(sequence) = MEDIA_SEQUENCE
            .captures(&self.header)
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            warn!("Media sequence missing in {}", self.url);
            return;
        };

        let Some(first) = segments.first() else {
            return;
        };
        match self.position(&first.name) {
            Some(index) => {
                let rewritten = sequence.saturating_sub(index as u64);
                self.header = MEDIA_SEQUENCE
                    .replace(&self.header, format!("EXT-X-MEDIA-SEQUENCE:{}", rewritten))
                    .into_owned();
                self.media_sequence = Some(rewritten);
            }
            None => error!("Media sequence processing error for {}", self.url),
        }
    }

    /// Drop the oldest entries beyond twice the window, keeping anything
    /// still advertised by the last manifest.
    fn trim(&mut self) {
        let bound = self.max_window_size * 2;
        while self.entries.len() > bound {
            let Some(pos) = self
                .entries
                .iter()
                .position(|e| !self.live_window.contains(&e.url))
            else {
                break;
            };
            self.entries.remove(pos);
        }
    }

    /// True when `name` (a segment name, or a full URL, proxified or not)
    /// matches a URL advertised by the last manifest.
    pub fn in_live_window(&self, name: &str) -> bool {
        let needle = if name.contains("://") {
            self.segment_name(name)
        } else {
            name.to_string()
        };
        self.live_window.iter().any(|u| u.contains(&needle))
    }

    /// Forget a segment the origin answered 404 for. It stays excluded from
    /// the live window for as long as the origin keeps listing it.
    pub fn report_404(&mut self, url: &str) {
        let name = self.segment_name(url);
        debug!("Dropping {} from journal {}", name, self.url);
        self.entries.retain(|e| e.name != name);
        let urls = &self.urls;
        self.live_window.retain(|u| segment_name(urls, u) != name);
        self.dead.insert(name);
    }

    /// Index of a segment in the retained history.
    pub fn position(&self, name_or_url: &str) -> Option<usize> {
        let name = self.segment_name(name_or_url);
        self.entries.iter().position(|e| e.name == name)
    }

    /// Upstream URL of the segment listed right after `url`.
    pub fn next_after(&self, url: &str) -> Option<&str> {
        let index = self.position(url)?;
        self.entries.get(index + 1).map(|e| e.url.as_str())
    }

    /// Upstream URLs of every retained segment listed before `url`.
    pub fn urls_before(&self, url: &str) -> Vec<String> {
        match self.position(url) {
            Some(index) => self.entries[..index].iter().map(|e| e.url.clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.position(url).is_some()
    }

    pub fn live_window(&self) -> &[String] {
        &self.live_window
    }

    pub fn entries(&self) -> &[SegmentRecord] {
        &self.entries
    }

    /// Media sequence of the first retained entry, as computed by the last `process`.
    pub fn media_sequence(&self) -> Option<u64> {
        self.media_sequence
    }

    /// Header plus every retained entry, as one playlist.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.header.len() + self.entries.len() * 64);
        out.push_str(&self.header);
        for entry in &self.entries {
            out.push('\n');
            out.push_str(&entry.lines);
        }
        out.push('\n');
        out
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn urls() -> ProxyUrls {
        ProxyUrls::new("127.0.0.1:9000".parse().unwrap())
    }

    fn manifest(sequence: u64, first: usize, count: usize) -> String {
        let mut body = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{}\n",
            sequence
        );
        for i in first..first + count {
            body.push_str(&format!(
                "#EXTINF:4.0,\nhttp://127.0.0.1:9000/s/cdn.example.com/live/seg{}.ts\n",
                i
            ));
        }
        body
    }

    fn journal() -> Journal {
        Journal::new("https://cdn.example.com/live/index.m3u8", urls(), 100)
    }

    #[test]
    fn segment_names_strip_proxy_and_host() {
        let j = journal();
        assert_eq!(
            j.segment_name("http://127.0.0.1:9000/s/cdn.example.com/live/seg1.ts?token=x"),
            "live/seg1.ts"
        );
        assert_eq!(
            j.segment_name("https://cdn.example.com/live/seg1.ts"),
            "live/seg1.ts"
        );
        assert_eq!(
            j.segment_name("http://cdn.example.com/a/chunk.m4s"),
            "a/chunk.m4s"
        );
        assert_eq!(j.segment_name("http://cdn.example.com/key.bin"), "key.bin");
    }

    #[test]
    fn process_builds_live_window() {
        let mut j = journal();
        j.process(&manifest(100, 1, 5));
        assert_eq!(j.live_window().len(), 5);
        assert_eq!(j.live_window()[0], "https://cdn.example.com/live/seg1.ts");
        assert!(j.in_live_window("seg3.ts"));
        assert!(j.in_live_window("http://127.0.0.1:9000/s/cdn.example.com/live/seg3.ts"));
        assert!(!j.in_live_window("seg9.ts"));
        assert_eq!(j.media_sequence(), Some(100));
    }

    #[test]
    fn process_is_idempotent() {
        let mut j = journal();
        let body = manifest(100, 1, 5);
        j.process(&body);
        let window = j.live_window().to_vec();
        let sequence = j.media_sequence();

        j.process(&body);
        assert_eq!(j.live_window(), &window[..]);
        assert_eq!(j.media_sequence(), sequence);
        assert_eq!(j.entries().len(), 5);
    }

    #[test]
    fn media_sequence_keeps_history_continuous() {
        let mut j = journal();
        j.process(&manifest(99, 0, 5)); // seg0..seg4
        j.process(&manifest(100, 1, 5)); // seg1..seg5

        // seg1 sits at index 1 of the history
        assert_eq!(j.media_sequence(), Some(100 - 1));
        assert_eq!(j.entries().len(), 6);
        assert!(j.render().contains("EXT-X-MEDIA-SEQUENCE:99"));
        // seg0 still renders first, so it keeps sequence 99
        let rendered = j.render();
        let first_uri = rendered.lines().find(|l| !l.starts_with('#')).unwrap();
        assert!(first_uri.ends_with("seg0.ts"));
    }

    #[test]
    fn unknown_first_segment_leaves_header_unchanged() {
        let mut j = journal();
        j.process("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:7\n#EXT-X-ENDLIST\n");
        assert_eq!(j.media_sequence(), None);
        assert!(j.render().contains("EXT-X-MEDIA-SEQUENCE:7"));
    }

    #[test]
    fn reported_404_leaves_the_window() {
        let mut j = journal();
        j.process(&manifest(100, 1, 5));
        j.report_404("http://127.0.0.1:9000/s/cdn.example.com/live/seg3.ts");
        assert!(!j.in_live_window("seg3.ts"));

        // the origin still lists it on the next refresh
        j.process(&manifest(101, 2, 5));
        assert!(!j.in_live_window("seg3.ts"));
        assert!(j.position("live/seg3.ts").is_none());
        assert_eq!(j.live_window().len(), 4);
    }

    #[test]
    fn history_is_bounded_to_twice_the_window() {
        let mut j = Journal::new("https://cdn.example.com/live/index.m3u8", urls(), 3);
        for round in 0..20 {
            j.process(&manifest(100 + round as u64, round, 3));
        }
        assert_eq!(j.entries().len(), 6);
        // the live window is always retained
        for url in j.live_window() {
            assert!(j.contains(url));
        }
        // sequence arithmetic still lines up with the retained history
        let first_live = j.position(&j.live_window()[0]).unwrap() as u64;
        assert_eq!(j.media_sequence().unwrap() + first_live, 119);
    }

    #[test]
    fn neighbours_in_order() {
        let mut j = journal();
        j.process(&manifest(100, 1, 5));
        assert_eq!(
            j.next_after("https://cdn.example.com/live/seg2.ts"),
            Some("https://cdn.example.com/live/seg3.ts")
        );
        assert_eq!(j.next_after("https://cdn.example.com/live/seg5.ts"), None);
        assert_eq!(j.urls_before("https://cdn.example.com/live/seg3.ts").len(), 2);
    }

    #[test]
    fn tag_lines_stay_with_their_segment() {
        let mut j = journal();
        j.process(
            "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:1\n#EXTINF:4,\n#EXT-X-BYTERANGE:100@0\nhttp://cdn.example.com/a.ts\n\
             #EXT-X-DISCONTINUITY\n#EXTINF:4,\nhttp://cdn.example.com/b.ts\n",
        );
        assert_eq!(j.entries().len(), 2);
        assert!(j.entries()[0].lines.contains("BYTERANGE"));
        assert!(j.entries()[1].lines.starts_with("#EXT-X-DISCONTINUITY"));
    }
}
