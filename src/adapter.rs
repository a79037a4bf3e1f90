use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::header::HeaderValue;
use reqwest::{Client as ReqwestClient, Method};
use serde::Serialize;
use tokio::task::AbortHandle;

use crate::config::HttpConfig;

pub type RestBytes = Bytes;
pub type RestFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type RestResult<T> = Result<T, RestError>;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identifies one dispatch of a request through a transport.
///
/// The funnel allocates a fresh id for every dispatch, so a transport can
/// correlate a later [`RestTransport::cancel`] with the exchange it started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestErrorKind {
    Connect,
    Send,
    Receive,
    Timeout,
    /// Status outside the acceptable range.
    Rejected,
    /// Empty body on a status that is not allowed to be empty.
    EmptyBody,
    Cancelled,
    Internal,
}

/// Failure reported by a transport, or by status/body validation of its response.
#[derive(Clone, Debug, thiserror::Error)]
#[error("rest error {kind:?} status={status:?} retryable={retryable} {message}")]
pub struct RestError {
    kind: RestErrorKind,
    status: Option<u16>,
    message: String,
    retryable: bool,
    body: Option<RestBytes>,
}

impl RestError {
    pub fn new(
        kind: RestErrorKind,
        status: Option<u16>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            retryable,
            body: None,
        }
    }

    pub fn connect(message: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::new(RestErrorKind::Connect, status, message, retryable)
    }

    pub fn send(message: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::new(RestErrorKind::Send, status, message, retryable)
    }

    pub fn receive(message: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::new(RestErrorKind::Receive, status, message, retryable)
    }

    pub fn timeout(message: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::new(RestErrorKind::Timeout, status, message, retryable)
    }

    pub fn rejected(status: u16, body: impl Into<RestBytes>) -> Self {
        Self::new(
            RestErrorKind::Rejected,
            Some(status),
            format!("response status {status} is not acceptable"),
            status == 429 || status >= 500,
        )
        .with_body(body)
    }

    pub fn empty_body(status: u16) -> Self {
        Self::new(
            RestErrorKind::EmptyBody,
            Some(status),
            format!("response with status {status} has an empty body"),
            false,
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(RestErrorKind::Cancelled, None, message, false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RestErrorKind::Internal, None, message, false)
    }

    pub fn with_body(mut self, body: impl Into<RestBytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn from_reqwest(kind: RestErrorKind, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RestErrorKind::Timeout
        } else if err.is_connect() {
            RestErrorKind::Connect
        } else {
            kind
        };
        let status = err.status().map(|s| s.as_u16());
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        Self::new(kind, status, err.to_string(), retryable)
    }

    pub fn kind(&self) -> RestErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Hint for callers that run their own retry policy; nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Response body that accompanied the failure, if the exchange got that far.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

#[derive(Clone, Debug)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, RestBytes)>,
    pub body: Option<RestBytes>,
    pub timeout: Option<Duration>,
}

impl RestRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<RestBytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<RestBytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `payload` with sonic-rs and sets a JSON content type.
    pub fn with_json<T: Serialize>(self, payload: &T) -> RestResult<Self> {
        let body = sonic_rs::to_vec(payload)
            .map_err(|err| RestError::internal(format!("failed to encode json body: {err}")))?;
        Ok(self
            .with_header("content-type", Bytes::from_static(b"application/json"))
            .with_body(body))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone, Debug)]
pub struct RestResponse {
    pub status: u16,
    pub headers: Vec<(String, RestBytes)>,
    pub body: RestBytes,
    pub elapsed: Duration,
}

impl RestResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&RestBytes> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }
}

/// The HTTP engine the funnel delegates to.
///
/// An implementation reports exactly one outcome per `execute` and honours
/// `cancel` on a best-effort basis. Status validation is not its concern; the
/// funnel applies its [`ResponsePolicy`](crate::ResponsePolicy) to whatever
/// response comes back.
pub trait RestTransport: Send + Sync {
    fn execute(&self, id: RequestId, request: RestRequest) -> RestFuture<RestResult<RestResponse>>;

    /// Asks the engine to abandon the exchange started under `id`.
    fn cancel(&self, id: RequestId);
}

pub type SharedRestTransport = dyn RestTransport + Send + Sync;

/// [`RestTransport`] backed by `reqwest`.
///
/// Every exchange runs as its own Tokio task registered under its
/// [`RequestId`]; `cancel` aborts that task.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: ReqwestClient,
    in_flight: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_client(ReqwestClient::new())
    }

    pub fn with_client(client: ReqwestClient) -> Self {
        Self {
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(config: &HttpConfig) -> RestResult<Self> {
        let client = config
            .build_client()
            .map_err(|err| RestError::internal(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(client))
    }

    pub fn in_flight(&self) -> usize {
        lock_unpoisoned(&self.in_flight).len()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RestTransport for ReqwestTransport {
    fn execute(&self, id: RequestId, request: RestRequest) -> RestFuture<RestResult<RestResponse>> {
        let client = self.client.clone();
        let in_flight = Arc::clone(&self.in_flight);
        Box::pin(async move {
            let exchange = tokio::spawn(send(client, request));
            lock_unpoisoned(&in_flight).insert(id, exchange.abort_handle());
            let joined = exchange.await;
            lock_unpoisoned(&in_flight).remove(&id);

            match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => {
                    Err(RestError::cancelled(format!("request {id} was cancelled")))
                }
                Err(err) => Err(RestError::internal(format!("request {id} task failed: {err}"))),
            }
        })
    }

    fn cancel(&self, id: RequestId) {
        if let Some(handle) = lock_unpoisoned(&self.in_flight).remove(&id) {
            tracing::trace!(request_id = %id, "aborting reqwest exchange");
            handle.abort();
        }
    }
}

async fn send(client: ReqwestClient, request: RestRequest) -> RestResult<RestResponse> {
    let start = Instant::now();
    let mut req = client.request(request.method.clone(), &request.url);

    for (key, value) in request.headers {
        let value = HeaderValue::from_bytes(value.as_ref())
            .map_err(|err| RestError::internal(format!("invalid header {key}: {err}")))?;
        req = req.header(key, value);
    }

    if let Some(body) = request.body {
        req = req.body(body);
    }

    if let Some(timeout) = request.timeout {
        req = req.timeout(timeout);
    }

    let resp = req
        .send()
        .await
        .map_err(|err| RestError::from_reqwest(RestErrorKind::Send, err))?;

    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), Bytes::copy_from_slice(value.as_ref())))
        .collect();
    let body = resp
        .bytes()
        .await
        .map_err(|err| RestError::from_reqwest(RestErrorKind::Receive, err))?;

    Ok(RestResponse {
        status,
        headers,
        body,
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let first = RequestId::next();
        let second = RequestId::next();
        assert!(second > first);
        assert_ne!(first.get(), second.get());
    }

    #[test]
    fn rejected_error_keeps_status_and_body() {
        let err = RestError::rejected(503, "busy");
        assert_eq!(err.kind(), RestErrorKind::Rejected);
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.body(), Some(b"busy".as_slice()));
        assert!(err.is_retryable());

        let not_found = RestError::rejected(404, Bytes::new());
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn json_body_sets_content_type() {
        let request = RestRequest::post("https://api.example.com/items")
            .with_json(&[1, 2, 3])
            .expect("array should serialize");
        assert_eq!(request.body.as_deref(), Some(b"[1,2,3]".as_slice()));
        assert!(
            request
                .headers
                .iter()
                .any(|(k, v)| k == "content-type" && v.as_ref() == b"application/json")
        );
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = RestResponse {
            status: 200,
            headers: vec![("X-Trace".to_string(), Bytes::from_static(b"abc"))],
            body: Bytes::new(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(response.header("x-trace").map(|v| v.as_ref()), Some(b"abc".as_slice()));
        assert!(response.header("missing").is_none());
    }

    #[tokio::test]
    async fn cancel_without_exchange_is_a_no_op() {
        let transport = ReqwestTransport::new();
        transport.cancel(RequestId::next());
        assert_eq!(transport.in_flight(), 0);
    }
}
