//! Local HLS/MPEG-TS reverse proxy.
//!
//! Players fetch proxified URLs from a loopback listener. Each upstream
//! resource is fetched once and multiplexed to every client asking for it,
//! manifests are rewritten so that every URI routes back through the proxy,
//! and a per-playlist journal tracks the live window.

pub mod cache;
pub mod config;
pub mod error;
pub mod hls;
pub mod http_retry;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod ts;
pub mod upstream;
