use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{TransportError, TransportErrorKind};

/// A fully resolved request, ready to be put on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-case header names; repeated headers are joined with ", ".
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub latency: Duration,
}

impl HttpResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The black-box client the step executor talks to.
///
/// Implementations perform exactly one attempt per call. Timeouts and cancellation
/// are applied by the caller by dropping the returned future.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_pool_size(256)
    }

    /// Create a client keeping at most `pool_size` idle connections per host.
    pub fn with_pool_size(pool_size: usize) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client }
    }
}

#[async_trait]
impl Transport for HttpClient {
    // Must be called inside a Tokio Runtime
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let request_start = Instant::now();

        let uri: Uri = request
            .url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| TransportError::invalid_request(e.to_string()))?;

        let mut builder = Request::builder().uri(uri).method(request.method);
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let req_hyper = builder
            .body(Full::new(request.body))
            .map_err(|e| TransportError::invalid_request(e.to_string()))?;

        let response = self.client.request(req_hyper).await.map_err(|e| {
            let kind = if e.is_connect() {
                TransportErrorKind::Connect
            } else {
                TransportErrorKind::Io
            };
            TransportError::new(kind, error_chain(&e))
        })?;

        // Always read the body to completion so the connection can go back to the pool
        let (parts, body_stream) = response.into_parts();
        let body = body_stream
            .collect()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Io, e.to_string()))?
            .to_bytes();
        let latency = request_start.elapsed();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in parts.headers.iter() {
            let value = String::from_utf8_lossy(v.as_bytes());
            headers
                .entry(k.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }

        debug!(status = parts.status.as_u16(), latency_ms = latency.as_millis() as u64, "response received");

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            headers,
            body,
            latency,
        })
    }
}

/// hyper wraps the interesting cause (e.g. "Connection refused") a few levels deep.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
