//! Alternate-bitrate playlists of each master manifest, used as fallbacks
//! when one of them starts answering 404.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mirror {
    pub url: String,
    pub name: String,
    pub online: bool,
}

/// Outcome of looking up a fallback for a playlist that answered 404.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fallback {
    /// The URL is not a known variant of any master
    NotMirrored,
    /// Another variant of the same master is still online
    Redirect(String),
    /// Every variant of that master is offline
    Exhausted,
}

#[derive(Clone, Debug, Default)]
pub struct MirrorSet {
    /// master URL -> variants in manifest order
    masters: Arc<DashMap<String, Vec<Mirror>>>,
}

impl MirrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record variants of `master`. Known variants keep their online flag.
    pub fn record(&self, master: &str, variants: impl IntoIterator<Item = (String, String)>) {
        let mut entry = self.masters.entry(master.to_string()).or_default();
        for (url, name) in variants {
            if !entry.iter().any(|m| m.url == url) {
                entry.push(Mirror {
                    url,
                    name,
                    online: true,
                });
            }
        }
    }

    /// Flag `url` offline and pick the first other online variant of the
    /// same master.
    pub fn fallback_for(&self, url: &str) -> Fallback {
        let mut result = Fallback::NotMirrored;
        for mut master in self.masters.iter_mut() {
            let Some(idx) = master.iter().position(|m| m.url == url) else {
                continue;
            };
            master[idx].online = false;

            result = match master.iter().find(|m| m.online) {
                Some(other) => {
                    warn!("Fallback playlist redirect {} >> {} ({})", url, other.url, other.name);
                    Fallback::Redirect(other.url.clone())
                }
                None => {
                    warn!("No more fallbacks for {} in {}", url, master.key());
                    Fallback::Exhausted
                }
            };
            break;
        }
        result
    }

    pub fn mirrors_of(&self, master: &str) -> Vec<Mirror> {
        self.masters
            .get(master)
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}
