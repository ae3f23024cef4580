//! Mapping between upstream URLs and the proxy's own path space.
//!
//! `http://host/path`  <-> `http://127.0.0.1:PORT/host/path`
//! `https://host/path` <-> `http://127.0.0.1:PORT/s/host/path`

use std::net::SocketAddr;

use url::{Host, Url};

use crate::error::ProxyError;

/// Path prefix marking an `https` upstream.
const SECURE_PREFIX: &str = "s/";

#[derive(Clone, Debug)]
pub struct ProxyUrls {
    addr: SocketAddr,
    /// `http://127.0.0.1:PORT/`
    base: String,
}

impl ProxyUrls {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            base: format!("http://{}/", addr),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_proxified(&self, url: &str) -> bool {
        url.starts_with(&self.base)
    }

    /// Route an absolute upstream URL through the proxy. Anything that is not
    /// an absolute http(s) URL, or is already proxified, is returned as is.
    pub fn proxify(&self, url: &str) -> String {
        if self.is_proxified(url) {
            return url.to_string();
        }
        if let Some(rest) = url.strip_prefix("https://") {
            format!("{}{}{}", self.base, SECURE_PREFIX, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("{}{}", self.base, rest)
        } else {
            url.to_string()
        }
    }

    /// Inverse of [`proxify`](Self::proxify). Non-proxified input is returned as is.
    pub fn unproxify(&self, url: &str) -> String {
        match url.strip_prefix(&self.base) {
            Some(rest) => Self::from_local_path(rest),
            None => url.to_string(),
        }
    }

    /// Upstream URL for a request path (with query) received by the listener,
    /// e.g. `/s/cdn.example.com/live.m3u8?token=1`.
    pub fn unproxify_path(&self, path_and_query: &str) -> String {
        Self::from_local_path(path_and_query.trim_start_matches('/'))
    }

    fn from_local_path(rest: &str) -> String {
        match rest.strip_prefix(SECURE_PREFIX) {
            Some(secure) => format!("https://{}", secure),
            None => format!("http://{}", rest),
        }
    }

    /// Check that an unproxified target is something we can fetch: an
    /// absolute http(s) URL with a host that is not this listener.
    pub fn validate_upstream(&self, url: &str) -> Result<Url, ProxyError> {
        let parsed = Url::parse(url)
            .map_err(|_| ProxyError::InvalidPath(format!("Invalid upstream URL: {url}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ProxyError::InvalidPath(format!(
                    "Scheme '{scheme}' not allowed"
                )));
            }
        }

        let host = parsed
            .host()
            .ok_or_else(|| ProxyError::InvalidPath(format!("No host in URL: {url}")))?;

        let points_here = match host {
            Host::Ipv4(ip) => std::net::IpAddr::V4(ip) == self.addr.ip(),
            Host::Ipv6(ip) => std::net::IpAddr::V6(ip) == self.addr.ip(),
            Host::Domain(domain) => domain == "localhost" && self.addr.ip().is_loopback(),
        };
        if points_here && parsed.port_or_known_default() == Some(self.addr.port()) {
            return Err(ProxyError::InvalidPath(format!(
                "Refusing to proxy to ourselves: {url}"
            )));
        }

        Ok(parsed)
    }
}
