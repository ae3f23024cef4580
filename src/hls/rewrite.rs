//! Manifest rewriting: every URI a manifest references is absolutized
//! against the manifest's own URL and routed back through the proxy.
//!
//! URI lines are rewritten by directory. The proxified form of each distinct
//! directory prefix is computed once and reused for every line sharing it.
//! `URI="..."` attributes on tag lines (keys, maps, renditions) get the same
//! treatment one by one.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};
use url::Url;

use super::parser::{self, ManifestKind};
use crate::server::proxy_url::ProxyUrls;

static URI_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(URI="?)([^\n"']+)"#).expect("valid regex"));

/// A variant playlist of a master manifest, resolved to its upstream URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedVariant {
    pub url: String,
    pub bitrate: Option<u64>,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct RewrittenManifest {
    pub body: String,
    pub kind: ManifestKind,
    /// Empty unless `kind` is `Master`
    pub variants: Vec<ResolvedVariant>,
}

/// Resolve `path` against `base`. Protocol-relative paths become `http:`.
pub fn absolutize(path: &str, base: &str) -> String {
    if let Some(rest) = path.strip_prefix("//") {
        return format!("http://{}", rest);
    }
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(path)) {
        Ok(u) => u.to_string(),
        Err(_) => {
            let dir = base.rsplit_once('/').map(|(d, _)| d).unwrap_or(base);
            format!("{}/{}", dir, path.trim_start_matches("./"))
        }
    }
}

/// Undo the HTML entity escaping some origins apply to URIs.
fn decode_entities(uri: &str) -> String {
    if !(uri.contains('&') && uri.contains(';')) {
        return uri.to_string();
    }
    uri.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Directory prefix of a URI (up to and including the last `/` before any query).
fn dirname(uri: &str) -> &str {
    let path_end = uri.find(['?', '#']).unwrap_or(uri.len());
    match uri[..path_end].rfind('/') {
        Some(i) => &uri[..=i],
        None => "",
    }
}

pub struct ManifestRewriter {
    urls: ProxyUrls,
}

impl ManifestRewriter {
    pub fn new(urls: ProxyUrls) -> Self {
        Self { urls }
    }

    pub fn urls(&self) -> &ProxyUrls {
        &self.urls
    }

    /// Rewrite a manifest fetched from `url`.
    pub fn rewrite(&self, body: &str, url: &str) -> RewrittenManifest {
        let body = body.trim();

        let (kind, variants) = match parser::inspect(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Lines are still rewritten, the structure is just unknown.
                warn!("Rewriting unparsed manifest {}: {}", url, e);
                (ManifestKind::Media, Vec::new())
            }
        };

        let variants = variants
            .into_iter()
            .map(|v| ResolvedVariant {
                url: absolutize(&decode_entities(&v.uri), url),
                bitrate: v.bitrate,
                name: v.name,
            })
            .collect();

        let mut dirs: HashMap<String, String> = HashMap::new();
        let mut out = String::with_capacity(body.len() * 2);

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                out.push_str(&self.rewrite_attributes(trimmed, url));
            } else if trimmed.is_empty() || self.urls.is_proxified(trimmed) {
                out.push_str(trimmed);
            } else {
                let uri = decode_entities(trimmed);
                let dn = dirname(&uri);
                let prefix = dirs.entry(dn.to_string()).or_insert_with(|| {
                    let dir = absolutize(if dn.is_empty() { "./" } else { dn }, url);
                    let proxified = self.urls.proxify(&dir);
                    debug!("Directory {:?} -> {}", dn, proxified);
                    proxified
                });
                out.push_str(prefix);
                out.push_str(&uri[dn.len()..]);
            }
            out.push('\n');
        }

        RewrittenManifest {
            body: out,
            kind,
            variants,
        }
    }

    fn rewrite_attributes(&self, line: &str, base: &str) -> String {
        if !line.to_ascii_uppercase().contains("URI=") {
            return line.to_string();
        }
        URI_ATTRIBUTE
            .replace_all(line, |caps: &Captures| {
                let value = &caps[2];
                if self.urls.is_proxified(value) {
                    return format!("{}{}", &caps[1], value);
                }
                let absolute = absolutize(&decode_entities(value), base);
                format!("{}{}", &caps[1], self.urls.proxify(&absolute))
            })
            .into_owned()
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> ManifestRewriter {
        ManifestRewriter::new(ProxyUrls::new("127.0.0.1:7000".parse().unwrap()))
    }

    const MEDIA_URL: &str = "https://cdn.example.com/live/hi/index.m3u8?token=abc";

    #[test]
    fn absolutize_cases() {
        assert_eq!(
            absolutize("seg1.ts", MEDIA_URL),
            "https://cdn.example.com/live/hi/seg1.ts"
        );
        assert_eq!(
            absolutize("../lo/index.m3u8", MEDIA_URL),
            "https://cdn.example.com/live/lo/index.m3u8"
        );
        assert_eq!(
            absolutize("/root.ts", MEDIA_URL),
            "https://cdn.example.com/root.ts"
        );
        assert_eq!(
            absolutize("//other.example.com/a.ts", MEDIA_URL),
            "http://other.example.com/a.ts"
        );
        assert_eq!(
            absolutize("http://x.example.com/a.ts", MEDIA_URL),
            "http://x.example.com/a.ts"
        );
    }

    #[test]
    fn dirname_ignores_query_slashes() {
        assert_eq!(dirname("a/b/c.ts?x=1/2"), "a/b/");
        assert_eq!(dirname("c.ts?x=1/2"), "");
        assert_eq!(dirname("http://h/c.ts"), "http://h/");
    }

    #[test]
    fn media_segments_are_proxified() {
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:1\n\
                    #EXTINF:4.0,\nseg1.ts?t=1\n#EXTINF:4.0,\nsub/seg2.ts\n\
                    #EXTINF:4.0,\nhttp://other.example.com/seg3.ts\n";
        let out = rewriter().rewrite(body, MEDIA_URL);

        assert_eq!(out.kind, ManifestKind::Media);
        let uris: Vec<&str> = out.body.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            uris,
            vec![
                "http://127.0.0.1:7000/s/cdn.example.com/live/hi/seg1.ts?t=1",
                "http://127.0.0.1:7000/s/cdn.example.com/live/hi/sub/seg2.ts",
                "http://127.0.0.1:7000/other.example.com/seg3.ts",
            ]
        );
    }

    #[test]
    fn uri_attributes_are_proxified() {
        let body = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x1\n\
                    #EXT-X-MAP:URI=\"http://127.0.0.1:7000/cdn.example.com/init.mp4\"\n\
                    #EXTINF:4.0,\nseg1.ts\n";
        let out = rewriter().rewrite(body, MEDIA_URL);
        assert!(out.body.contains(
            "URI=\"http://127.0.0.1:7000/s/cdn.example.com/live/hi/key.bin\",IV=0x1"
        ));
        // already proxified values are left alone
        assert!(
            out.body
                .contains("URI=\"http://127.0.0.1:7000/cdn.example.com/init.mp4\"")
        );
    }

    #[test]
    fn master_variants_are_resolved() {
        let body = "#EXTM3U\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1920x1080\nhi/index.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nlo/index.m3u8\n";
        let out = rewriter().rewrite(body, "http://cdn.example.com/live/master.m3u8");

        assert_eq!(out.kind, ManifestKind::Master);
        assert_eq!(out.variants.len(), 2);
        assert_eq!(out.variants[0].url, "http://cdn.example.com/live/hi/index.m3u8");
        assert_eq!(out.variants[1].bitrate, Some(800_000));
        assert!(
            out.body
                .contains("\nhttp://127.0.0.1:7000/cdn.example.com/live/lo/index.m3u8\n")
        );
    }

    #[test]
    fn entities_in_uris_are_decoded() {
        let body = "#EXTM3U\n#EXTINF:4.0,\nseg1.ts?a=1&amp;b=2\n";
        let out = rewriter().rewrite(body, MEDIA_URL);
        assert!(
            out.body
                .contains("http://127.0.0.1:7000/s/cdn.example.com/live/hi/seg1.ts?a=1&b=2")
        );
    }

    #[test]
    fn unparseable_body_still_rewritten() {
        let out = rewriter().rewrite("garbage\n", "http://cdn.example.com/x/list.m3u8");
        assert_eq!(out.body, "http://127.0.0.1:7000/cdn.example.com/x/garbage\n");
    }
}
