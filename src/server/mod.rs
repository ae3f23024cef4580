pub mod handlers;
pub mod headers;
pub mod proxy_url;
pub mod state;

use crate::config::Config;
use axum::Router;
use state::AppState;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router. Every path is a proxified upstream URL, so there are no
/// fixed routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .fallback(handlers::proxy::proxy)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listener, then serve until ctrl-c.
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::new(config.bind_addr, config.port);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };
    // the proxified URL scheme needs the real port
    let local = listener.local_addr()?;

    let state = AppState::new(config, local)?;
    let registry = state.registry.clone();
    let app = build_router(state);

    info!("🚀 Proxy listening on http://{}", local);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    registry.destroy().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
