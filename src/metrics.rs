//! Counters and gauges recorded through the `metrics` facade.
//!
//! Nothing is exported unless `install_exporter` is called; without a
//! recorder every call below is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Serve the Prometheus scrape endpoint on its own listener.
pub fn install_exporter(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("📈 Metrics exporter listening on http://{}/metrics", addr);
    Ok(())
}

pub fn record_request(kind: &'static str, status: u16) {
    counter!("hlsmux_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
}

pub fn record_duration(kind: &'static str, start: Instant) {
    histogram!("hlsmux_request_duration_seconds", "kind" => kind)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_fetch() {
    counter!("hlsmux_upstream_fetches_total").increment(1);
}

pub fn record_upstream_bytes(bytes: usize) {
    counter!("hlsmux_upstream_bytes_total").increment(bytes as u64);
}

pub fn record_prefetch() {
    counter!("hlsmux_prefetch_total").increment(1);
}

pub fn record_eviction(count: usize) {
    counter!("hlsmux_cache_evictions_total").increment(count as u64);
}

pub fn set_cache_disk_bytes(bytes: u64) {
    gauge!("hlsmux_cache_disk_bytes").set(bytes as f64);
}

pub fn set_bitrate(bps: u64) {
    gauge!("hlsmux_playlist_bitrate_bps").set(bps as f64);
}

pub fn record_ts_emitted(bytes: usize) {
    counter!("hlsmux_ts_emitted_bytes_total").increment(bytes as u64);
}
