//! Transport abstraction: the collaborator that actually talks HTTP
//!
//! Resources never perform I/O themselves. They hand a [`TransportRequest`]
//! to a [`Transport`], which must call the supplied completion exactly once,
//! from any thread, with either a response or a [`TransportError`].

#[cfg(feature = "backend-reqwest")]
pub mod reqwest;

#[cfg(feature = "backend-reqwest")]
pub use self::reqwest::ReqwestTransport;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Failures reported by a transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection or protocol failure
    #[error("Network error: {message}")]
    Network {
        /// Description from the underlying client
        message: String,
    },

    /// The request timed out
    #[error("Request timed out")]
    Timeout,

    /// The request was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Platform-agnostic HTTP request handed to a transport
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method for the request
    pub method: Method,
    /// URL for the request
    pub url: Url,
    /// Headers for the request
    pub headers: HeaderMap,
    /// Optional body content
    pub body: Option<Bytes>,
}

impl TransportRequest {
    /// Create a bodiless request with no headers
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Complete response received by a transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Byte counters for an in-flight transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferMetrics {
    /// Request body bytes sent so far
    pub request_bytes_sent: u64,
    /// Total request body size, if known
    pub request_bytes_total: Option<u64>,
    /// Response body bytes received so far
    pub response_bytes_received: u64,
    /// Total response body size, if known
    pub response_bytes_total: Option<u64>,
}

/// Callback a transport invokes exactly once with the outcome of a request
pub type TransportCompletion =
    Box<dyn FnOnce(Result<TransportResponse, TransportError>) + Send + 'static>;

/// Pluggable HTTP provider
pub trait Transport {
    /// Begin sending `request`.
    ///
    /// The transport must invoke `completion` exactly once. It may do so on
    /// any thread, but must not do so before this method returns.
    fn start_request(
        &self,
        request: TransportRequest,
        completion: TransportCompletion,
    ) -> Box<dyn TransportTask>;
}

/// Handle to one in-flight transport operation
pub trait TransportTask {
    /// Best-effort abort. The completion may still be called afterwards.
    fn cancel(&self);

    /// Current byte counters
    fn transfer_metrics(&self) -> TransferMetrics;
}

/// Proxy server settings
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Username for proxy authentication
    pub username: Option<String>,
    /// Password for proxy authentication
    pub password: Option<String>,
}

/// Configuration for the default transport
#[derive(Clone, Debug, Default)]
pub struct TransportConfig {
    /// Request timeout
    pub timeout: Option<Duration>,
    /// User agent string
    pub user_agent: Option<String>,
    /// Default headers to add to all requests
    pub default_headers: Option<HeaderMap>,
    /// Enable or disable cookies
    pub use_cookies: Option<bool>,
    /// HTTP proxy configuration
    pub http_proxy: Option<ProxyConfig>,
    /// HTTPS proxy configuration
    pub https_proxy: Option<ProxyConfig>,
    /// SOCKS proxy configuration
    pub socks_proxy: Option<ProxyConfig>,
}
