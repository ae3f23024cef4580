//! Upstream request retry and backoff.
//!
//! [`send_with_retry`] re-sends a request on network errors and on statuses
//! that usually clear up by themselves (5xx, 429). Any other status is handed
//! back untouched so the registry can apply its own status translation.

use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

use crate::config::Config;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Configuration for [`send_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
    /// Optional per-request timeout applied to each individual attempt.
    ///
    /// When `None`, the client's own timeout applies.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: None,
        }
    }
}

impl RetryConfig {
    /// `FETCH_RETRIES` counts retries, so one more attempt than that is made.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.fetch_retries.saturating_add(1),
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Some(config.fetch_timeout()),
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Statuses worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Send the request produced by `build`, retrying per `config`.
///
/// `build` is called once per attempt since a `RequestBuilder` is consumed
/// by `send`.
///
/// # Errors
///
/// Returns the last network error once all attempts are exhausted. A
/// retryable status on the final attempt is returned as `Ok`.
pub async fn send_with_retry<F>(
    url: &str,
    config: &RetryConfig,
    mut build: F,
) -> Result<Response, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..max_attempts {
        let mut request = build();
        if let Some(timeout) = config.timeout {
            request = request.timeout(timeout);
        }

        match request.send().await {
            Ok(response) if !is_retryable_status(response.status()) => return Ok(response),

            Ok(response) => {
                warn!(
                    "Upstream returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt,
                    max_attempts
                );
            }

            Err(e) => {
                warn!(
                    "Upstream fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
            }
        }

        tokio::time::sleep(config.backoff).await;
    }

    // Final attempt, returned as is
    let mut request = build();
    if let Some(timeout) = config.timeout {
        request = request.timeout(timeout);
    }

    request.send().await.inspect_err(|e| {
        warn!(
            "Upstream fetch failed for {} (attempt {}/{}): {}",
            url, max_attempts, max_attempts, e
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff: Duration::from_millis(1),
            timeout: None,
        }
    }

    #[test]
    fn attempts_follow_configured_retries() {
        let config = Config {
            fetch_retries: 3,
            ..Default::default()
        };
        let retry = RetryConfig::from_config(&config);
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    // ---- Integration tests using wiremock ----

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let uri = server.uri();
        let response = send_with_retry(&uri, &quick(3), || client.get(&uri))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn retries_on_server_error_then_succeeds() {
        let server = MockServer::start().await;

        // 200 fallback (lower priority, mounted first)
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        // 500 on first hit (mounted last, deactivates after 1)
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let uri = server.uri();
        let response = send_with_retry(&uri, &quick(2), || client.get(&uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let uri = server.uri();
        let response = send_with_retry(&uri, &quick(3), || client.get(&uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn last_server_error_is_returned_after_exhaustion() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = Client::new();
        let uri = server.uri();
        let response = send_with_retry(&uri, &quick(2), || client.get(&uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn network_error_after_all_attempts() {
        // Nothing listens on this port once the listener is dropped
        let uri = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };

        let client = Client::new();
        let result = send_with_retry(&uri, &quick(2), || client.get(&uri)).await;
        assert!(result.is_err());
    }
}
