use crate::{
    cache::SpillStore,
    config::Config,
    error::Result,
    registry::RequestRegistry,
    server::proxy_url::ProxyUrls,
    upstream::{LogFailureSink, ReqwestTransport},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Proxified URL scheme for the bound address
    pub urls: ProxyUrls,
    /// Every in-flight and cached upstream resource
    pub registry: RequestRegistry,
}

impl AppState {
    /// Create the state for a proxy reachable at `addr`.
    ///
    /// Without a usable scratch directory, responses are kept in memory.
    pub fn new(config: Config, addr: SocketAddr) -> Result<Self> {
        let config = Arc::new(config);
        let urls = ProxyUrls::new(addr);
        let transport = Arc::new(ReqwestTransport::new(&config)?);

        let store = match SpillStore::create(&config.cache_dir) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(
                    "Cache directory {} unusable, keeping responses in memory: {}",
                    config.cache_dir.display(),
                    e
                );
                None
            }
        };

        let registry = RequestRegistry::new(
            config.clone(),
            urls.clone(),
            transport,
            store,
            Arc::new(LogFailureSink),
        );

        Ok(Self {
            config,
            urls,
            registry,
        })
    }
}
