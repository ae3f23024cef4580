//! Per-instance scratch directory for spilled fragments.
//!
//! Each proxy instance owns one directory under the configured cache root.
//! Multiplexers write full fragments there once they are no longer needed in
//! memory, plus a `.headers` sidecar per resource. The directory is removed
//! when the store is dropped; directories left behind by instances that died
//! without cleaning up are swept on the next start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::Disks;
use tracing::{debug, info, warn};

const DIR_PREFIX: &str = "hlsmux-";

/// Readable part of a file stem, ahead of the URL digest.
const PLAIN_PREFIX: usize = 32;

/// Hex digits of the URL digest kept in a file stem.
const DIGEST_CHARS: usize = 16;

/// Instance directories older than this are considered abandoned.
pub const STALE_DIR_AGE: Duration = Duration::from_secs(3600);

/// Contents of a `.headers` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersSidecar {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct SpillStore {
    dir: PathBuf,
}

impl SpillStore {
    /// Create a fresh instance directory under `root`, sweeping abandoned
    /// siblings first.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let swept = sweep_stale(root, STALE_DIR_AGE);
        if swept > 0 {
            info!("Removed {} abandoned cache directories", swept);
        }

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let dir = root.join(format!("{}{}-{}", DIR_PREFIX, std::process::id(), stamp));
        std::fs::create_dir_all(&dir)?;
        debug!("Cache directory {}", dir.display());

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filesystem-safe stem for a resource URL: a sanitized prefix for
    /// readability followed by a digest of the full URL, so distinct URLs
    /// never share spill files.
    pub fn file_stem(url: &str) -> String {
        let sanitized: String = url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .chars()
            .filter(char::is_ascii)
            .take(PLAIN_PREFIX)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = hex::encode(Sha256::digest(url.as_bytes()));

        format!("{}-{}", sanitized, &digest[..DIGEST_CHARS])
    }

    pub fn fragment_path(&self, stem: &str, generation: u64, index: usize) -> PathBuf {
        self.dir.join(format!("{}-{}-{}", stem, generation, index))
    }

    pub fn headers_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.headers", stem))
    }

    pub async fn write_fragment(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(path, data).await
    }

    pub async fn read_fragment(&self, path: &Path) -> std::io::Result<Bytes> {
        tokio::fs::read(path).await.map(Bytes::from)
    }

    /// Persist response headers next to the fragments of `stem`.
    pub async fn write_headers(&self, stem: &str, sidecar: &HeadersSidecar) -> std::io::Result<()> {
        let body = serde_json::to_vec(sidecar).map_err(std::io::Error::other)?;
        tokio::fs::write(self.headers_path(stem), body).await
    }

    /// Remove a spilled file. Failures are logged and left to the startup sweep.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Free space on the disk holding the scratch directory.
    pub fn available_space(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let path = self.dir.to_string_lossy();
        let mut best_match: Option<(&sysinfo::Disk, usize)> = None;

        for disk in disks.list() {
            let mount_point = disk.mount_point().to_string_lossy();
            if path.starts_with(mount_point.as_ref()) {
                let mount_len = mount_point.len();
                if best_match.is_none_or(|(_, len)| mount_len > len) {
                    best_match = Some((disk, mount_len));
                }
            }
        }

        best_match.map(|(disk, _)| disk.available_space())
    }

    /// Remove the whole instance directory.
    pub fn purge(&self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed cache directory {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.dir.display(), e),
        }
    }
}

impl Drop for SpillStore {
    fn drop(&mut self) {
        self.purge();
    }
}

/// Delete instance directories under `root` last modified more than
/// `max_age` ago. Returns how many were removed.
pub fn sweep_stale(root: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(DIR_PREFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.is_some_and(|a| a > max_age) {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to sweep {}: {}", entry.path().display(), e),
            }
        }
    }
    removed
}
