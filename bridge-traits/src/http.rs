//! HTTP Client Abstraction
//!
//! Provides async HTTP operations for availability probes and catalog fetches.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Query parameter appended to probes and fetches to defeat intermediary caches.
pub const CACHE_BUST_PARAM: &str = "_cb";

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
    Head,
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Head, url)
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.header("Authorization", format!("Bearer {}", token.into()))
    }

    /// Append a query parameter, respecting any query string already present.
    pub fn query(mut self, key: &str, value: impl AsRef<str>) -> Self {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        self.url = format!("{}{}{}={}", self.url, separator, key, value.as_ref());
        self
    }

    /// Append the cache-busting parameter with the given token (usually a
    /// millisecond timestamp).
    pub fn cache_busted(self, token: i64) -> Self {
        self.query(CACHE_BUST_PARAM, token.to_string())
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// HTTP response
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Parse response body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON deserialization failed: {}", e))
        })
    }

    /// Get response body as UTF-8 string
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid UTF-8: {}", e)))
    }

    /// Check if response status is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response status is a redirect (3xx)
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Check if response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Async HTTP client trait
///
/// This trait abstracts HTTP operations to allow platform-specific implementations.
/// Implementations must honour `HttpRequest::timeout` and report an elapsed
/// timeout as [`BridgeError::Timeout`] so callers can classify it.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn probe(client: &dyn HttpClient) -> bool {
///     let request = HttpRequest::head("https://cdn.example.com/catalog.json")
///         .cache_busted(1_700_000_000_000)
///         .timeout(Duration::from_secs(5));
///
///     client.execute(request).await.is_ok()
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute an HTTP request
    ///
    /// Non-2xx statuses are returned as responses, not errors. Errors are
    /// reserved for transport failures (DNS, connect, TLS, timeout).
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        Http {}

        #[async_trait]
        impl HttpClient for Http {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    #[test]
    fn test_http_request_builder() {
        let request = HttpRequest::new(HttpMethod::Get, "https://example.com")
            .header("User-Agent", "test")
            .bearer_token("secret")
            .timeout(Duration::from_secs(5));

        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.headers.get("User-Agent"), Some(&"test".to_string()));
        assert!(request.headers.contains_key("Authorization"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_cache_busting_appends_param() {
        let request = HttpRequest::head("https://example.com/catalog.json").cache_busted(42);
        assert_eq!(request.url, "https://example.com/catalog.json?_cb=42");

        let request = HttpRequest::get("https://example.com/catalog?v=2").cache_busted(7);
        assert_eq!(request.url, "https://example.com/catalog?v=2&_cb=7");
    }

    #[test]
    fn test_http_response_status_checks() {
        let response = HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from("test"),
        };

        assert!(response.is_success());
        assert!(!response.is_redirect());
        assert!(!response.is_client_error());
        assert!(!response.is_server_error());

        let redirect = HttpResponse {
            status: 302,
            headers: HashMap::new(),
            body: Bytes::new(),
        };
        assert!(redirect.is_redirect());
    }

    #[tokio::test]
    async fn test_mock_client_reports_timeout() {
        let mut client = MockHttp::new();
        client
            .expect_execute()
            .withf(|req| req.method == HttpMethod::Head && req.url.contains("_cb="))
            .times(1)
            .returning(|_| Err(BridgeError::Timeout("probe".to_string())));

        let request = HttpRequest::head("https://example.com").cache_busted(1);
        let err = client.execute(request).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
