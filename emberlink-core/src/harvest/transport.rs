//! Transport capability for harvest payloads
//!
//! The scheduler only needs "send bytes to an endpoint, classify the result".
//! Everything below that abstraction (connection pooling, TLS, timeouts)
//! belongs to the transport implementation. A transport never returns a Rust
//! error to the scheduler: failures are classified outcomes, because the
//! scheduler's retry/abort decisions hang on that classification.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};

/// Classified result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Payload accepted by the collector
    Accepted,
    /// Transient failure: network error, timeout, 5xx, or throttling
    Retryable(String),
    /// Explicit rejection: the collector will never accept this payload
    Permanent(String),
}

/// Send bytes to a collector endpoint and classify the result.
pub trait Transport {
    /// Send `body` to `endpoint`. The transport owns its timeout; a timeout
    /// is reported as [`SendOutcome::Retryable`].
    fn send(
        &self,
        endpoint: &str,
        body: &[u8],
    ) -> impl std::future::Future<Output = SendOutcome> + Send;
}

/// HTTP transport to a Brightwell collector.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport from collector configuration.
    ///
    /// Returns an error if the configuration is invalid or missing required
    /// fields.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("collector.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, body: &[u8]) -> SendOutcome {
        let url = self.url_for(endpoint);

        let response = match self
            .http_client
            .post(&url)
            .body(body.to_vec())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Network errors and client-side timeouts are transient.
                return SendOutcome::Retryable(format!("HTTP request failed: {}", e));
            }
        };

        let status = response.status();
        classify_status(status.as_u16())
    }
}

/// Map an HTTP status code to a send outcome.
///
/// 408 (request timeout) and 429 (throttling) are transient despite being
/// 4xx; every other 4xx is an explicit rejection.
pub fn classify_status(status: u16) -> SendOutcome {
    match status {
        200..=299 => SendOutcome::Accepted,
        408 | 429 => SendOutcome::Retryable(format!("API status {}", status)),
        500..=599 => SendOutcome::Retryable(format!("API status {}", status)),
        other => SendOutcome::Permanent(format!("API status {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        assert_eq!(classify_status(200), SendOutcome::Accepted);
        assert_eq!(classify_status(202), SendOutcome::Accepted);
    }

    #[test]
    fn test_classify_retryable() {
        assert!(matches!(classify_status(500), SendOutcome::Retryable(_)));
        assert!(matches!(classify_status(503), SendOutcome::Retryable(_)));
        assert!(matches!(classify_status(429), SendOutcome::Retryable(_)));
        assert!(matches!(classify_status(408), SendOutcome::Retryable(_)));
    }

    #[test]
    fn test_classify_permanent() {
        assert!(matches!(classify_status(400), SendOutcome::Permanent(_)));
        assert!(matches!(classify_status(401), SendOutcome::Permanent(_)));
        assert!(matches!(classify_status(410), SendOutcome::Permanent(_)));
        assert!(matches!(classify_status(413), SendOutcome::Permanent(_)));
    }

    #[test]
    fn test_transport_requires_valid_config() {
        let config = CollectorConfig::default();
        assert!(HttpTransport::new(&config).is_err());
    }

    #[test]
    fn test_transport_with_valid_config() {
        let config = CollectorConfig {
            base_url: Some("https://brightwell.example.com".to_string()),
            api_key: Some("bw_live_test".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.url_for("/harvest/ajax"),
            "https://brightwell.example.com/harvest/ajax"
        );
    }
}
