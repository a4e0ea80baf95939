//! Reqwest transport for cross-platform HTTP support

use super::{
    TransferMetrics, Transport, TransportCompletion, TransportConfig, TransportError,
    TransportRequest, TransportResponse,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Default transport, backed by a shared `reqwest::Client`.
///
/// Requests run on the ambient tokio runtime.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a new Reqwest transport
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            TransportError::Internal(format!("Failed to create reqwest client: {}", e))
        })?;

        Ok(Self { client })
    }

    /// Create a new Reqwest transport with configuration
    pub fn with_config(config: TransportConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        if let Some(default_headers) = config.default_headers {
            builder = builder.default_headers(default_headers);
        }

        if config.use_cookies.unwrap_or(false) {
            builder = builder.cookie_store(true);
        }

        if let Some(http_proxy) = config.http_proxy {
            let proxy_url = format!("http://{}:{}", http_proxy.host, http_proxy.port);
            let mut proxy = reqwest::Proxy::http(&proxy_url)
                .map_err(|e| TransportError::Internal(format!("Invalid HTTP proxy: {}", e)))?;

            if let (Some(username), Some(password)) = (&http_proxy.username, &http_proxy.password) {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        if let Some(https_proxy) = config.https_proxy {
            let proxy_url = format!("https://{}:{}", https_proxy.host, https_proxy.port);
            let mut proxy = reqwest::Proxy::https(&proxy_url)
                .map_err(|e| TransportError::Internal(format!("Invalid HTTPS proxy: {}", e)))?;

            if let (Some(username), Some(password)) = (&https_proxy.username, &https_proxy.password)
            {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        if let Some(socks_proxy) = config.socks_proxy {
            let proxy_url = format!("socks5://{}:{}", socks_proxy.host, socks_proxy.port);
            let mut proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| TransportError::Internal(format!("Invalid SOCKS proxy: {}", e)))?;

            if let (Some(username), Some(password)) = (&socks_proxy.username, &socks_proxy.password)
            {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            TransportError::Internal(format!("Failed to create reqwest client: {}", e))
        })?;

        Ok(Self { client })
    }

    /// Get the underlying reqwest client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    sent_total: AtomicU64,
    received: AtomicU64,
    received_total: AtomicU64,
}

struct ReqwestTask {
    cancel: Arc<Notify>,
    counters: Arc<Counters>,
}

impl super::TransportTask for ReqwestTask {
    fn cancel(&self) {
        self.cancel.notify_one();
    }

    fn transfer_metrics(&self) -> TransferMetrics {
        // zero totals mean unknown
        let total = |counter: &AtomicU64| match counter.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        };
        TransferMetrics {
            request_bytes_sent: self.counters.sent.load(Ordering::Relaxed),
            request_bytes_total: total(&self.counters.sent_total),
            response_bytes_received: self.counters.received.load(Ordering::Relaxed),
            response_bytes_total: total(&self.counters.received_total),
        }
    }
}

impl Transport for ReqwestTransport {
    fn start_request(
        &self,
        request: TransportRequest,
        completion: TransportCompletion,
    ) -> Box<dyn super::TransportTask> {
        let cancel = Arc::new(Notify::new());
        let counters = Arc::new(Counters::default());

        let client = self.client.clone();
        let task_cancel = cancel.clone();
        let task_counters = counters.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = execute(client, request, &task_counters) => result,
                _ = task_cancel.notified() => Err(TransportError::Cancelled),
            };
            completion(result);
        });

        Box::new(ReqwestTask { cancel, counters })
    }
}

async fn execute(
    client: reqwest::Client,
    request: TransportRequest,
    counters: &Counters,
) -> Result<TransportResponse, TransportError> {
    let mut req_builder = client
        .request(request.method, request.url)
        .headers(request.headers);

    if let Some(body) = request.body {
        let len = body.len() as u64;
        counters.sent_total.store(len, Ordering::Relaxed);
        req_builder = req_builder.body(body);
        // reqwest does not report upload progress; count the body as sent once handed over
        counters.sent.store(len, Ordering::Relaxed);
    }

    let response = req_builder.send().await.map_err(map_error)?;

    let status = response.status();
    let headers = response.headers().clone();
    if let Some(len) = response.content_length() {
        counters.received_total.store(len, Ordering::Relaxed);
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_error)?;
        counters
            .received
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        body.extend_from_slice(&chunk);
    }

    Ok(TransportResponse {
        status,
        headers,
        body: body.into(),
    })
}

fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network {
            message: format!("Request failed: {}", error),
        }
    }
}
