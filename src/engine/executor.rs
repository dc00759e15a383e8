use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use hyper::body::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::http_client::{HttpRequest, HttpResponse, Transport};
use crate::error::TransportError;
use crate::stats::{MetricsSink, RequestRecord};
use crate::utils::parse_duration;

/// Request description as written by a script author.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Strings are sent verbatim, any other value is serialized as JSON.
    #[serde(default)]
    pub body: Option<Value>,
    /// Sent as application/x-www-form-urlencoded.
    #[serde(default)]
    pub form: Option<serde_json::Map<String, Value>>,
    /// Overrides the engine's default request timeout.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl RequestSpec {
    pub fn from_value(value: &Value) -> Result<Self, TransportError> {
        if !value.is_object() {
            return Err(TransportError::invalid_request(
                "request spec must be an object",
            ));
        }
        RequestSpec::deserialize(value)
            .map_err(|e| TransportError::invalid_request(format!("invalid request spec: {}", e)))
    }

    pub fn method(&self) -> Result<Method, TransportError> {
        match &self.method {
            None => Ok(Method::GET),
            Some(m) => Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| TransportError::invalid_request(format!("invalid method '{}'", m))),
        }
    }

    /// Resolve into a wire request and the timeout to apply to it.
    pub fn into_request(
        self,
        default_timeout: Duration,
    ) -> Result<(HttpRequest, Duration), TransportError> {
        let method = self.method()?;
        let url = url::Url::parse(&self.url)
            .map_err(|e| TransportError::invalid_request(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::invalid_request(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        let timeout = match &self.timeout {
            Some(t) => parse_duration(t).map_err(|e| TransportError::invalid_request(e.to_string()))?,
            None => default_timeout,
        };

        let mut headers: Vec<(String, String)> = Vec::with_capacity(self.headers.len() + 1);
        for (name, value) in self.headers {
            http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::invalid_request(format!("invalid header name '{}'", name)))?;
            http::HeaderValue::from_str(&value).map_err(|_| {
                TransportError::invalid_request(format!("invalid value for header '{}'", name))
            })?;
            headers.push((name, value));
        }
        let has_content_type = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));

        let body = match (self.body, self.form) {
            (Some(_), Some(_)) => {
                return Err(TransportError::invalid_request(
                    "request spec cannot have both 'body' and 'form'",
                ))
            }
            (Some(Value::String(s)), None) => Bytes::from(s),
            (Some(Value::Null), None) | (None, None) => Bytes::new(),
            (Some(value), None) => {
                if !has_content_type {
                    headers.push(("content-type".to_string(), "application/json".to_string()));
                }
                Bytes::from(value.to_string())
            }
            (None, Some(form)) => {
                if !has_content_type {
                    headers.push((
                        "content-type".to_string(),
                        "application/x-www-form-urlencoded".to_string(),
                    ));
                }
                Bytes::from(crate::bridge::helpers::url_params_encode(&form))
            }
        };

        Ok((
            HttpRequest {
                method,
                url,
                headers,
                body,
            },
            timeout,
        ))
    }
}

/// Identifies which worker and iteration issued a step.
#[derive(Debug, Clone)]
pub struct StepOrigin {
    pub scenario: Arc<str>,
    pub user: u64,
    pub iteration: u64,
}

/// Issues HTTP steps through the transport and reports each one to the collector.
pub struct StepExecutor {
    transport: Arc<dyn Transport>,
    sink: MetricsSink,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(transport: Arc<dyn Transport>, sink: MetricsSink, default_timeout: Duration) -> Self {
        Self {
            transport,
            sink,
            default_timeout,
        }
    }

    /// Perform one request. Exactly one record is emitted per call, whatever the outcome.
    pub async fn dispatch(
        &self,
        origin: &StepOrigin,
        label: &str,
        spec: &Value,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let prepared = RequestSpec::from_value(spec).and_then(|s| s.into_request(self.default_timeout));
        let (request, timeout) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let raw_method = spec
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET")
                    .to_ascii_uppercase();
                let raw_url = spec
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.emit(origin, label, raw_method, raw_url, Instant::now(), Err(&err));
                return Err(err);
            }
        };

        let method = request.method.to_string();
        let url = request.url.to_string();
        let started_at = Instant::now();

        // Dropping the transport future on timeout or cancellation releases its connection
        let result = tokio::select! {
            res = tokio::time::timeout(timeout, self.transport.send(request)) => match res {
                Ok(res) => res,
                Err(_) => Err(TransportError::timeout(timeout)),
            },
            _ = cancel.cancelled() => Err(TransportError::cancelled()),
        };

        self.emit(origin, label, method, url, started_at, result.as_ref());
        result
    }

    /// Report a step that never reached the transport.
    pub fn reject(&self, origin: &StepOrigin, label: &str, err: TransportError) {
        self.emit(origin, label, String::new(), String::new(), Instant::now(), Err(&err));
    }

    fn emit(
        &self,
        origin: &StepOrigin,
        label: &str,
        method: String,
        url: String,
        started_at: Instant,
        result: Result<&HttpResponse, &TransportError>,
    ) {
        let (status, latency, error) = match result {
            Ok(resp) => (resp.status, resp.latency, None),
            Err(err) => (0, started_at.elapsed(), Some(err.clone())),
        };
        debug!(
            scenario = %origin.scenario,
            user = origin.user,
            iteration = origin.iteration,
            label,
            status,
            error = error.as_ref().map(|e| e.kind.as_str()),
            "http step"
        );
        self.sink.record_request(RequestRecord {
            scenario: origin.scenario.clone(),
            label: label.to_string(),
            user: origin.user,
            iteration: origin.iteration,
            method,
            url,
            status,
            latency,
            started_at,
            error,
        });
    }
}
