use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::ts::TsError;

/// Errors surfaced by the proxy, the multiplexer and the upstream adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Network-level failure talking to the origin (retried by the transport)
    #[error("Upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Origin answered with a status we could not use
    #[error("Upstream returned HTTP {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("Upstream fetch timed out: {0}")]
    Timeout(String),

    /// Stream ended before a usable response arrived
    #[error("Upstream fetch aborted: {0}")]
    Aborted(String),

    /// Misaligned TS packets, malformed manifest lines and similar
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("Playlist parse error: {0}")]
    PlaylistParse(String),

    /// Buffer over hard cap, allocation failure, disk budget persistently exceeded
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid proxy path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Offending upstream status code, when the failure carried one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UpstreamStatus { status, .. } => Some(*status),
            Self::Upstream(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Network errors, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(_) | Self::Timeout(_) => true,
            Self::UpstreamStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<TsError> for ProxyError {
    fn from(err: TsError) -> Self {
        match err {
            TsError::NotTransportStream { .. } => Self::ProtocolAnomaly(err.to_string()),
            TsError::Starved { .. } | TsError::OutOfMemory(_) => {
                Self::ResourceExhausted(err.to_string())
            }
            TsError::Destroyed => Self::Cancelled,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidPath(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_)
            | Self::UpstreamStatus { .. }
            | Self::Aborted(_)
            | Self::PlaylistParse(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        (
            status,
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            self.to_string(),
        )
            .into_response()
    }
}
