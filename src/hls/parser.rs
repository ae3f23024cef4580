use crate::error::{ProxyError, Result};
use m3u8_rs::{MasterPlaylist, Playlist, VariantStream, parse_playlist_res};
use tracing::debug;

/// Bitrates at or below this are treated as bogus attribute values.
const MIN_BITRATE: u64 = 128;

/// Which kind of playlist a manifest body is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestKind {
    Master,
    Media,
}

/// One alternate-bitrate playlist advertised by a master manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct VariantInfo {
    /// URI exactly as written in the manifest
    pub uri: String,
    pub bitrate: Option<u64>,
    /// Human-readable track name
    pub name: String,
}

/// Parse HLS playlist from string content
pub fn parse_hls_playlist(content: &str) -> Result<Playlist> {
    match parse_playlist_res(content.as_bytes()) {
        Ok(playlist) => Ok(playlist),
        Err(e) => {
            let error_msg = format!("Failed to parse playlist: {:?}", e);
            Err(ProxyError::PlaylistParse(error_msg))
        }
    }
}

/// Parse and keep only what the proxy needs from a master playlist.
pub fn inspect(content: &str) -> Result<(ManifestKind, Vec<VariantInfo>)> {
    match parse_hls_playlist(content.trim())? {
        Playlist::MasterPlaylist(master) => {
            let variants = variants(&master);
            debug!("Master playlist with {} variants", variants.len());
            Ok((ManifestKind::Master, variants))
        }
        Playlist::MediaPlaylist(_) => Ok((ManifestKind::Media, Vec::new())),
    }
}

pub fn variants(master: &MasterPlaylist) -> Vec<VariantInfo> {
    master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| VariantInfo {
            uri: v.uri.trim().to_string(),
            bitrate: variant_bitrate(v),
            name: track_name(v),
        })
        .collect()
}

/// `AVERAGE-BANDWIDTH` when plausible, else `BANDWIDTH`.
pub fn variant_bitrate(variant: &VariantStream) -> Option<u64> {
    variant
        .average_bandwidth
        .filter(|b| *b > MIN_BITRATE)
        .or(Some(variant.bandwidth).filter(|b| *b > MIN_BITRATE))
}

/// Name a variant from its attributes: resolution and bandwidth, plus
/// frame rate and codecs only while few attributes are known.
pub fn track_name(variant: &VariantStream) -> String {
    let mut parts = Vec::new();

    if let Some(res) = &variant.resolution {
        parts.push(format!("Resolution: {}x{}", res.width, res.height));
    }
    if variant.bandwidth > 0 {
        parts.push(format!("Bandwidth: {}", kbps(variant.bandwidth)));
    } else if let Some(avg) = variant.average_bandwidth {
        parts.push(format!("Average Bandwidth: {}", kbps(avg)));
    }
    if parts.len() < 2 {
        if let Some(fps) = variant.frame_rate {
            parts.push(format!("Frame Rate: {}", fps));
        }
    }
    if parts.len() < 2 {
        if let Some(codecs) = &variant.codecs {
            parts.push(format!("Codecs: {}", codecs));
        }
    }

    if parts.is_empty() {
        variant.uri.clone()
    } else {
        parts.join(" · ")
    }
}

fn kbps(bps: u64) -> String {
    if bps >= 1_000_000 {
        format!("{:.1} Mbps", bps as f64 / 1_000_000.0)
    } else {
        format!("{} kbps", bps / 1000)
    }
}

/// Whether a response should be treated as a manifest, from its content
/// type or, failing that, its URL.
pub fn is_manifest(content_type: Option<&str>, url: &str) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("mpegurl") {
            return true;
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// Whether a URL looks like a media segment.
pub fn is_segment_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    [".ts", ".mts", ".m2ts", ".m4s", ".aac", ".mp4", ".m4a", ".m4v", ".vtt"]
        .iter()
        .any(|ext| path.ends_with(ext))
}
