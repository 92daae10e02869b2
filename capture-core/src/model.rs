//! Transaction model
//!
//! A [`NetworkTransaction`] is one request/response pair observed by the
//! interceptor. Its fields are private: values are only produced through
//! [`NetworkTransaction::pending`] and the lifecycle transitions, so a
//! COMPLETE transaction always carries a response and an end time, a FAILED
//! one always carries an error, and a PENDING one has neither.

use crate::error::CaptureError;
use crate::headers::Headers;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// HTTP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
    /// Extension method, stored upper-case
    Other(String),
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Other(name) => name,
        }
    }
}

impl From<&str> for HttpMethod {
    fn from(value: &str) -> Self {
        let upper = value.trim().to_ascii_uppercase();
        match upper.as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            _ => HttpMethod::Other(upper),
        }
    }
}

impl From<String> for HttpMethod {
    fn from(value: String) -> Self {
        HttpMethod::from(value.as_str())
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

impl From<&hyper::Method> for HttpMethod {
    fn from(method: &hyper::Method) -> Self {
        HttpMethod::from(method.as_str())
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Complete,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Complete => "COMPLETE",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETE" => Ok(TransactionStatus::Complete),
            "FAILED" => Ok(TransactionStatus::Failed),
            _ => Err(CaptureError::UnknownStatus(s.to_string())),
        }
    }
}

/// Cut `body` to at most `max` bytes without splitting a UTF-8 sequence
fn truncate_body(body: &mut Option<String>, max: usize) {
    if let Some(text) = body {
        if text.len() > max {
            let mut end = max;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
    }
}

/// Outgoing request as captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
    pub content_type: Option<String>,
    /// Size of the full body in bytes, even when `body` was truncated
    pub body_size: u64,
    pub timestamp: i64,
}

impl NetworkRequest {
    pub fn new(method: impl Into<HttpMethod>, url: impl Into<String>, timestamp: i64) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Headers::new(),
            body: None,
            content_type: None,
            body_size: 0,
            timestamp,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.clone());
        }
        self.headers.set(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.content_type = headers.get("content-type").map(str::to_string);
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body_size = body.len() as u64;
        self.body = Some(body);
        self
    }

    /// Copy with the body cut to `max` bytes; `body_size` is kept
    pub fn truncated(&self, max: usize) -> Self {
        let mut copy = self.clone();
        truncate_body(&mut copy.body, max);
        copy
    }
}

/// Response as captured, or synthesized by a mock rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub body_size: u64,
    pub timestamp: i64,
}

impl NetworkResponse {
    pub fn new(status_code: u16, timestamp: i64) -> Self {
        let status_message = hyper::StatusCode::from_u16(status_code)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or_default()
            .to_string();
        Self {
            status_code,
            status_message,
            headers: Headers::new(),
            body: None,
            content_type: None,
            body_size: 0,
            timestamp,
        }
    }

    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = message.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.clone());
        }
        self.headers.set(name, value);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.content_type = headers.get("content-type").map(str::to_string);
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.body_size = body.len() as u64;
        self.body = Some(body);
        self
    }

    pub fn truncated(&self, max: usize) -> Self {
        let mut copy = self.clone();
        truncate_body(&mut copy.body, max);
        copy
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// One request/response pair and its lifecycle state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkTransaction {
    id: String,
    request: NetworkRequest,
    response: Option<NetworkResponse>,
    start_time: i64,
    end_time: Option<i64>,
    status: TransactionStatus,
    error: Option<String>,
}

impl NetworkTransaction {
    /// New in-flight transaction
    pub fn pending(id: impl Into<String>, request: NetworkRequest, start_time: i64) -> Self {
        Self {
            id: id.into(),
            request,
            response: None,
            start_time,
            end_time: None,
            status: TransactionStatus::Pending,
            error: None,
        }
    }

    /// Rebuild a transaction from stored columns, checking the lifecycle invariants
    pub fn from_parts(
        id: String,
        request: NetworkRequest,
        response: Option<NetworkResponse>,
        start_time: i64,
        end_time: Option<i64>,
        status: TransactionStatus,
        error: Option<String>,
    ) -> Result<Self> {
        let problem = match status {
            TransactionStatus::Pending if response.is_some() || end_time.is_some() => {
                Some("pending transaction has a response or end time")
            }
            TransactionStatus::Complete if response.is_none() || end_time.is_none() => {
                Some("complete transaction is missing its response or end time")
            }
            TransactionStatus::Failed if error.is_none() || end_time.is_none() => {
                Some("failed transaction is missing its error or end time")
            }
            _ => None,
        };

        if let Some(reason) = problem {
            return Err(CaptureError::InvalidTransaction {
                id,
                reason: reason.to_string(),
            });
        }

        Ok(Self {
            id,
            request,
            response,
            start_time,
            end_time,
            status,
            error,
        })
    }

    /// Move to COMPLETE with the given response
    pub fn complete(&mut self, response: NetworkResponse, end_time: i64) -> Result<()> {
        self.ensure_pending()?;
        self.response = Some(response);
        self.end_time = Some(end_time);
        self.status = TransactionStatus::Complete;
        Ok(())
    }

    /// Move to FAILED with the given error message
    pub fn fail(&mut self, error: impl Into<String>, end_time: i64) -> Result<()> {
        self.ensure_pending()?;
        self.error = Some(error.into());
        self.end_time = Some(end_time);
        self.status = TransactionStatus::Failed;
        Ok(())
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CaptureError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &NetworkRequest {
        &self.request
    }

    pub fn response(&self) -> Option<&NetworkResponse> {
        self.response.as_ref()
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Elapsed time between start and end, once the transaction has finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }
}

impl PartialEq for NetworkTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NetworkTransaction {}

impl Hash for NetworkTransaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
