use hlsmux::{
    config::Config,
    metrics, server,
    upstream::{FetchOptions, LogFailureSink, RelayOptions, ReqwestTransport, StreamRelay},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Setup logging
    tracing_subscriber::fmt::init();

    info!("🚀 Starting hlsmux - local HLS/MPEG-TS proxy");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(port) = config.metrics_port {
        if let Err(e) = metrics::install_exporter(SocketAddr::new(config.bind_addr, port)) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
    }

    let relay = match &config.relay_source {
        Some(source) => match start_relay(source, &config).await {
            Ok(relay) => Some(relay),
            Err(e) => {
                error!("Failed to start relay for {}: {}", source, e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let result = server::start(config).await;

    if let Some(relay) = relay {
        relay.destroy();
    }
    if let Err(e) = result {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }
}

/// Re-serve a continuous live source, cut on PCR boundaries, from its own
/// loopback endpoint.
async fn start_relay(source: &str, config: &Config) -> hlsmux::error::Result<Arc<StreamRelay>> {
    let transport = Arc::new(ReqwestTransport::new(config)?);
    let opts = RelayOptions {
        reassemble: Some(config.packet_filter_policy),
        check_sync_byte: true,
        ..RelayOptions::default()
    };
    let relay = StreamRelay::new(
        FetchOptions::from_config(source, config),
        transport,
        opts,
        Arc::new(LogFailureSink),
    );
    let endpoint = relay.start(config.bind_addr).await?;
    info!("📡 Relay endpoint: {}", endpoint);
    Ok(relay)
}
