//! Capture layer
//!
//! [`CaptureLayer`] wraps any tower service that takes and returns
//! `hyper` messages with [`Bytes`] bodies. Each call is recorded in the
//! collector, run through the rule engine, and finished with exactly one
//! terminal callback, including when the call future is dropped.

use crate::collector::NetworkCollector;
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::filter::ScopeMatcher;
use crate::headers::Headers;
use crate::metrics::CaptureMetrics;
use crate::model::{now_millis, NetworkRequest, NetworkResponse, NetworkTransaction};
use crate::rules::{RuleEngine, RuleOutcome, RuleSet};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{BoxError, Layer, Service};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type CaptureFuture = Pin<Box<dyn Future<Output = Result<Response<Bytes>, BoxError>> + Send>>;

#[derive(Clone)]
pub struct CaptureLayer {
    collector: NetworkCollector,
    engine: RuleEngine,
    rules: RuleSet,
    config: Arc<CaptureConfig>,
    scope: Arc<ScopeMatcher>,
    metrics: Arc<CaptureMetrics>,
}

impl CaptureLayer {
    pub fn new(collector: NetworkCollector, engine: RuleEngine, rules: RuleSet) -> Self {
        let config = CaptureConfig::default();
        Self {
            collector,
            engine,
            rules,
            scope: Arc::new(ScopeMatcher::from_config(&config)),
            config: Arc::new(config),
            metrics: Arc::new(CaptureMetrics::default()),
        }
    }

    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.scope = Arc::new(ScopeMatcher::from_config(&config));
        self.config = Arc::new(config);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<CaptureMetrics> {
        self.metrics.clone()
    }

    pub fn collector(&self) -> &NetworkCollector {
        &self.collector
    }

    fn in_scope(&self, request: &Request<Bytes>) -> bool {
        if !self.config.enabled {
            return false;
        }

        let host = request.uri().host().map(str::to_string).or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(':').next().unwrap_or(value).to_string())
        });

        self.scope.is_captured(host.as_deref().unwrap_or(""))
    }

    fn body_text(&self, body: &Bytes) -> Option<String> {
        if !self.config.capture_bodies || body.is_empty() {
            return None;
        }
        // Binary bodies are counted but not recorded
        std::str::from_utf8(body).ok().map(str::to_string)
    }

    fn describe_request(&self, parts: &Parts, body: &Bytes, timestamp: i64) -> NetworkRequest {
        let mut request = NetworkRequest::new(&parts.method, parts.uri.to_string(), timestamp)
            .with_headers(Headers::from(&parts.headers));
        request.body = self.body_text(body);
        request.body_size = body.len() as u64;
        request
    }

    fn describe_response(
        &self,
        parts: &hyper::http::response::Parts,
        body: &Bytes,
        timestamp: i64,
    ) -> NetworkResponse {
        let mut response = NetworkResponse::new(parts.status.as_u16(), timestamp)
            .with_headers(Headers::from(&parts.headers));
        response.body = self.body_text(body);
        response.body_size = body.len() as u64;
        response.truncated(self.config.max_body_bytes)
    }

    /// Wait for persistence when configured to
    async fn settle(&self) {
        if self.config.strict_persistence {
            self.collector.flush().await;
        }
    }

    async fn capture<S>(self, mut inner: S, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError>
    where
        S: Service<Request<Bytes>, Response = Response<Bytes>>,
        S::Error: Into<BoxError>,
    {
        if !self.in_scope(&request) {
            debug!("Out of scope, passing through: {}", request.uri());
            return inner.call(request).await.map_err(Into::into);
        }

        CaptureMetrics::incr(&self.metrics.total_requests);

        let id = Uuid::new_v4().to_string();
        let start = now_millis();
        let (mut parts, mut body) = request.into_parts();
        let described = self.describe_request(&parts, &body, start);

        let outcome = {
            let rules = self.rules.snapshot();
            self.engine.apply(&id, &described, &rules)
        };

        let recorded = match &outcome {
            RuleOutcome::ModifiedRequest(modified) => {
                apply_modifications(&mut parts, &mut body, &described, modified);
                modified
            }
            _ => &described,
        };

        self.collector.on_transaction_started(NetworkTransaction::pending(
            id.clone(),
            recorded.truncated(self.config.max_body_bytes),
            start,
        ));
        let mut guard = TerminalGuard::new(id, self.collector.clone(), self.metrics.clone());

        match outcome {
            RuleOutcome::Blocked(reason) => {
                CaptureMetrics::incr(&self.metrics.blocked);
                info!("Request blocked by rule: {} ({})", described.url, reason);
                guard.fail(format!("blocked: {}", reason));
                self.settle().await;
                return Err(Box::new(CaptureError::Blocked { reason }));
            }
            RuleOutcome::ShortCircuitResponse(mocked) => {
                CaptureMetrics::incr(&self.metrics.short_circuited);
                let result = match synthesize(&mocked) {
                    Ok(response) => {
                        guard.complete(mocked.truncated(self.config.max_body_bytes));
                        Ok(response)
                    }
                    Err(e) => {
                        guard.fail(e.to_string());
                        Err(e)
                    }
                };
                self.settle().await;
                return result;
            }
            RuleOutcome::Delayed(delay) => {
                CaptureMetrics::incr(&self.metrics.delayed);
                debug!("Delaying request {} by {:?}", described.url, delay);
                tokio::time::sleep(delay).await;
            }
            RuleOutcome::ModifiedRequest(_) => {
                CaptureMetrics::incr(&self.metrics.modified);
            }
            RuleOutcome::Unmodified => {}
        }

        let result = match inner.call(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                guard.complete(self.describe_response(&parts, &body, now_millis()));
                Ok(Response::from_parts(parts, body))
            }
            Err(e) => {
                let e: BoxError = e.into();
                guard.fail(e.to_string());
                Err(e)
            }
        };

        self.settle().await;
        result
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CaptureService<S> {
    inner: S,
    layer: CaptureLayer,
}

impl<S> Service<Request<Bytes>> for CaptureService<S>
where
    S: Service<Request<Bytes>, Response = Response<Bytes>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response<Bytes>;
    type Error = BoxError;
    type Future = CaptureFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        // Use the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();
        Box::pin(layer.capture(inner, request))
    }
}

/// Ensures one terminal callback per captured transaction
struct TerminalGuard {
    id: String,
    collector: NetworkCollector,
    metrics: Arc<CaptureMetrics>,
    finished: bool,
}

impl TerminalGuard {
    fn new(id: String, collector: NetworkCollector, metrics: Arc<CaptureMetrics>) -> Self {
        Self {
            id,
            collector,
            metrics,
            finished: false,
        }
    }

    fn complete(&mut self, response: NetworkResponse) {
        self.finished = true;
        CaptureMetrics::incr(&self.metrics.completed);
        self.collector
            .on_transaction_completed(&self.id, response, now_millis());
    }

    fn fail(&mut self, error: String) {
        self.finished = true;
        CaptureMetrics::incr(&self.metrics.failed);
        self.collector.on_transaction_failed(&self.id, error, now_millis());
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Transaction {} dropped before finishing", self.id);
            CaptureMetrics::incr(&self.metrics.cancelled);
            CaptureMetrics::incr(&self.metrics.failed);
            self.collector
                .on_transaction_failed(&self.id, "cancelled", now_millis());
        }
    }
}

/// Write a rule's request changes onto the outgoing request
fn apply_modifications(
    parts: &mut Parts,
    body: &mut Bytes,
    original: &NetworkRequest,
    modified: &NetworkRequest,
) {
    if modified.method != original.method {
        match Method::from_bytes(modified.method.as_str().as_bytes()) {
            Ok(method) => parts.method = method,
            Err(e) => warn!("Rule produced invalid method '{}': {}", modified.method, e),
        }
    }

    if modified.url != original.url {
        match modified.url.parse::<Uri>() {
            Ok(uri) => parts.uri = uri,
            Err(e) => warn!("Rule produced invalid url '{}': {}", modified.url, e),
        }
    }

    if modified.headers != original.headers {
        apply_header_changes(&mut parts.headers, &original.headers, &modified.headers);
    }

    if modified.body != original.body {
        if let Some(text) = &modified.body {
            *body = Bytes::from(text.clone());
            if parts.headers.contains_key(CONTENT_LENGTH) || !body.is_empty() {
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
        }
    }
}

/// Touch only the header names whose captured value changed. Values the
/// captured view cannot represent stay on the wire untouched.
fn apply_header_changes(wire: &mut HeaderMap, original: &Headers, modified: &Headers) {
    for (name, _) in original.iter() {
        if !modified.contains(name) {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                wire.remove(name);
            }
        }
    }

    for (name, value) in modified.iter() {
        if original.get(name) == Some(value) {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                wire.insert(name, value);
            }
            _ => warn!("Rule produced invalid header '{}: {}'", name, value),
        }
    }
}

/// Build a wire response from a mocked one
fn synthesize(mocked: &NetworkResponse) -> Result<Response<Bytes>, BoxError> {
    let status = StatusCode::from_u16(mocked.status_code)?;
    let body = mocked.body.clone().map(Bytes::from).unwrap_or_default();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = mocked.headers.to_header_map();
    if let Some(content_type) = &mocked.content_type {
        if !response.headers().contains_key(CONTENT_TYPE) {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_str(content_type)?);
        }
    }
    let length = response.body().len();
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_modifications_updates_parts() {
        let (mut parts, _) = Request::post("https://example.com/a")
            .header("content-length", "3")
            .body(())
            .unwrap()
            .into_parts();
        let mut body = Bytes::from_static(b"abc");

        let original = NetworkRequest::new("POST", "https://example.com/a", 0)
            .with_header("content-length", "3")
            .with_body("abc");
        let modified = original
            .clone()
            .with_header("X-Test", "1")
            .with_body("abcdef");

        apply_modifications(&mut parts, &mut body, &original, &modified);
        assert_eq!(body, Bytes::from_static(b"abcdef"));
        assert_eq!(parts.headers.get("content-length").unwrap(), "6");
        assert_eq!(parts.headers.get("x-test").unwrap(), "1");
    }

    #[test]
    fn test_header_rule_keeps_unrelated_headers() {
        let (mut parts, _) = Request::get("https://example.com/a")
            .header("x-latin1", HeaderValue::from_bytes(b"caf\xe9").unwrap())
            .header("x-multi", "a")
            .header("x-multi", "b")
            .header("x-drop", "1")
            .body(())
            .unwrap()
            .into_parts();
        let mut body = Bytes::new();

        let original = NetworkRequest {
            headers: Headers::from(&parts.headers),
            ..NetworkRequest::new("GET", "https://example.com/a", 0)
        };
        let mut modified = original.clone();
        modified.headers.set("X-Debug", "1");
        modified.headers.remove("x-drop");

        apply_modifications(&mut parts, &mut body, &original, &modified);

        assert_eq!(parts.headers.get("x-latin1").unwrap().as_bytes(), b"caf\xe9");
        let multi: Vec<&str> = parts
            .headers
            .get_all("x-multi")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(multi, vec!["a", "b"]);
        assert_eq!(parts.headers.get("x-debug").unwrap(), "1");
        assert!(parts.headers.get("x-drop").is_none());
        assert!(body.is_empty());
    }

    #[test]
    fn test_synthesize_mock_response() {
        let mocked = NetworkResponse::new(418, 0)
            .with_header("Content-Type", "text/plain")
            .with_body("teapot");
        let response = synthesize(&mocked).unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "6");
        assert_eq!(response.body(), &Bytes::from_static(b"teapot"));
    }
}
