use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use bytes::Bytes;
use reqwest::Method;
use serde::Serialize;
use sonic_rs::to_vec;

use super::adapter::{
    RequestId, RestBytes, RestError, RestFuture, RestRequest, RestResponse, RestResult,
    RestTransport, lock_unpoisoned,
};

/// Coarse state of the mock transport, mirroring what a real engine would report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestTransportState {
    Idle,
    Busy,
    Error,
}

/// What the mock does with the next request it receives.
#[derive(Clone, Debug, Default)]
pub enum MockBehavior {
    /// Answer with the next queued response, or an empty 200.
    #[default]
    Pass,
    /// Wait, then answer like `Pass`.
    Delay(Duration),
    /// Never answer; only cancellation ends the exchange.
    Pending,
    /// Answer with this status and body.
    Reject { status: u16, reason: String },
    /// Fail at the transport level.
    Fail(RestError),
}

impl MockBehavior {
    pub fn pass() -> Self {
        Self::Pass
    }

    pub fn delay(ms: u64) -> Self {
        Self::Delay(Duration::from_millis(ms))
    }

    pub fn pending() -> Self {
        Self::Pending
    }

    pub fn reject(status: u16, reason: impl Into<String>) -> Self {
        Self::Reject {
            status,
            reason: reason.into(),
        }
    }

    pub fn connect_error(reason: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::Fail(RestError::connect(reason, status, retryable))
    }

    pub fn send_error(reason: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::Fail(RestError::send(reason, status, retryable))
    }

    pub fn receive_error(reason: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::Fail(RestError::receive(reason, status, retryable))
    }

    pub fn timeout_error(reason: impl Into<String>, status: Option<u16>, retryable: bool) -> Self {
        Self::Fail(RestError::timeout(reason, status, retryable))
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::Fail(RestError::internal(reason))
    }

    /// The engine dropped the exchange without an answer.
    pub fn drop_response() -> Self {
        Self::Fail(RestError::timeout("mock transport dropped response", None, false))
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockBehaviorPlan {
    request: VecDeque<MockBehavior>,
}

impl MockBehaviorPlan {
    pub fn push(&mut self, behavior: MockBehavior) -> &mut Self {
        self.request.push_back(behavior);
        self
    }

    pub fn pop(&mut self) -> MockBehavior {
        self.request.pop_front().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, RestBytes)>,
    pub body: RestBytes,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<RestBytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<RestBytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, Bytes::new())
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, body.into())
    }

    pub fn json<T: Serialize>(status: u16, payload: &T) -> RestResult<Self> {
        let body = to_vec(payload)
            .map_err(|err| RestError::internal(format!("mock json encode failed: {err}")))?;
        Ok(Self::new(status, body))
    }
}

#[derive(Clone, Debug)]
pub struct MockRestStateSnapshot {
    pub state: RestTransportState,
    pub request_count: usize,
    pub last_url: Option<String>,
    pub last_status: Option<u16>,
    pub behavior_remaining: usize,
    pub response_queue_len: usize,
    pub route_queue_len: usize,
    pub cancelled: Vec<RequestId>,
    pub elapsed_total: Duration,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct MockRestAdapterState {
    state: RestTransportState,
    request_count: usize,
    last_url: Option<String>,
    last_status: Option<u16>,
    behavior_plan: MockBehaviorPlan,
    default_response_queue: VecDeque<MockResponse>,
    route_response_queues: HashMap<(Method, String), VecDeque<MockResponse>>,
    outbound_log: Vec<(RequestId, RestRequest)>,
    cancelled: Vec<RequestId>,
    last_error: Option<String>,
    elapsed_total: Duration,
}

impl MockRestAdapterState {
    fn new(behavior_plan: MockBehaviorPlan) -> Self {
        Self {
            state: RestTransportState::Idle,
            request_count: 0,
            last_url: None,
            last_status: None,
            behavior_plan,
            default_response_queue: VecDeque::new(),
            route_response_queues: HashMap::new(),
            outbound_log: Vec::new(),
            cancelled: Vec::new(),
            last_error: None,
            elapsed_total: Duration::ZERO,
        }
    }

    fn snapshot(&self) -> MockRestStateSnapshot {
        MockRestStateSnapshot {
            state: self.state,
            request_count: self.request_count,
            last_url: self.last_url.clone(),
            last_status: self.last_status,
            behavior_remaining: self.behavior_plan.len(),
            response_queue_len: self.default_response_queue.len(),
            route_queue_len: self.route_response_queues.values().map(VecDeque::len).sum(),
            cancelled: self.cancelled.clone(),
            elapsed_total: self.elapsed_total,
            last_error: self.last_error.clone(),
        }
    }

    fn next_response(&mut self, request: &RestRequest) -> Option<MockResponse> {
        let route_key = (request.method.clone(), request.url.clone());
        if let Some(response) = self
            .route_response_queues
            .get_mut(&route_key)
            .and_then(VecDeque::pop_front)
        {
            return Some(response);
        }
        self.default_response_queue.pop_front()
    }
}

/// Deterministic in-memory [`RestTransport`].
///
/// Responses come from per-route queues, then the default queue, then an
/// empty 200. Every `cancel` call is recorded so tests can observe it.
#[derive(Clone, Debug)]
pub struct MockRestAdapter {
    state: Arc<Mutex<MockRestAdapterState>>,
}

impl MockRestAdapter {
    pub fn new() -> Self {
        Self::with_behavior_plan(MockBehaviorPlan::default())
    }

    pub fn with_behavior_plan(behavior_plan: MockBehaviorPlan) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockRestAdapterState::new(behavior_plan))),
        }
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let mut plan = MockBehaviorPlan::default();
        plan.push(behavior);
        Self::with_behavior_plan(plan)
    }

    fn lock(&self) -> MutexGuard<'_, MockRestAdapterState> {
        lock_unpoisoned(&self.state)
    }

    pub fn snapshot(&self) -> MockRestStateSnapshot {
        self.lock().snapshot()
    }

    pub fn push_behavior(&self, behavior: MockBehavior) {
        self.lock().behavior_plan.push(behavior);
    }

    pub fn queue_response(&self, response: MockResponse) {
        self.lock().default_response_queue.push_back(response);
    }

    pub fn queue_response_for(
        &self,
        method: Method,
        url: impl Into<String>,
        response: MockResponse,
    ) {
        self.lock()
            .route_response_queues
            .entry((method, url.into()))
            .or_default()
            .push_back(response);
    }

    pub fn queue_get_response(&self, url: impl Into<String>, response: MockResponse) {
        self.queue_response_for(Method::GET, url, response);
    }

    pub fn queue_post_response(&self, url: impl Into<String>, response: MockResponse) {
        self.queue_response_for(Method::POST, url, response);
    }

    pub fn queue_error_json<T: Serialize>(
        &self,
        url: impl Into<String>,
        status: u16,
        payload: &T,
    ) -> RestResult<()> {
        let response = MockResponse::json(status, payload)?;
        self.queue_get_response(url, response);
        Ok(())
    }

    pub fn outbound(&self) -> Vec<(RequestId, RestRequest)> {
        self.lock().outbound_log.clone()
    }

    pub fn cancelled(&self) -> Vec<RequestId> {
        self.lock().cancelled.clone()
    }

    fn record_error(&self, error: RestError) -> RestError {
        let mut state = self.lock();
        state.state = RestTransportState::Error;
        state.last_error = Some(error.message().to_string());
        state.last_status = error.status();
        error
    }

    fn record_response(&self, response: MockResponse, start: Instant) -> RestResponse {
        let elapsed = start.elapsed();
        let mut state = self.lock();
        state.state = RestTransportState::Idle;
        state.last_status = Some(response.status);
        state.elapsed_total += elapsed;
        RestResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            elapsed,
        }
    }
}

impl Default for MockRestAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl RestTransport for MockRestAdapter {
    fn execute(&self, id: RequestId, request: RestRequest) -> RestFuture<RestResult<RestResponse>> {
        let adapter = self.clone();
        Box::pin(async move {
            let start = Instant::now();
            let behavior = {
                let mut state = adapter.lock();
                state.request_count += 1;
                state.last_url = Some(request.url.clone());
                state.state = RestTransportState::Busy;
                state.last_error = None;
                state.outbound_log.push((id, request.clone()));
                state.behavior_plan.pop()
            };

            match behavior {
                MockBehavior::Pass => {}
                MockBehavior::Delay(duration) => tokio::time::sleep(duration).await,
                MockBehavior::Pending => std::future::pending::<()>().await,
                MockBehavior::Reject { status, reason } => {
                    return Ok(adapter.record_response(MockResponse::text(status, reason), start));
                }
                MockBehavior::Fail(error) => return Err(adapter.record_error(error)),
            }

            let response = adapter
                .lock()
                .next_response(&request)
                .unwrap_or_else(|| MockResponse::empty(200));
            Ok(adapter.record_response(response, start))
        })
    }

    fn cancel(&self, id: RequestId) {
        let mut state = self.lock();
        state.cancelled.push(id);
        state.state = RestTransportState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RestErrorKind;

    #[tokio::test]
    async fn route_queue_wins_over_default_queue() {
        let adapter = MockRestAdapter::new();
        adapter.queue_response(MockResponse::text(200, "default"));
        adapter.queue_get_response("https://api.example.com/a", MockResponse::text(201, "routed"));

        let routed = adapter
            .execute(RequestId::next(), RestRequest::get("https://api.example.com/a"))
            .await
            .expect("mock answers");
        assert_eq!(routed.status, 201);

        let fallback = adapter
            .execute(RequestId::next(), RestRequest::get("https://api.example.com/a"))
            .await
            .expect("mock answers");
        assert_eq!(fallback.body(), b"default");

        let empty = adapter
            .execute(RequestId::next(), RestRequest::get("https://api.example.com/a"))
            .await
            .expect("mock answers");
        assert_eq!(empty.status, 200);
        assert!(empty.body().is_empty());

        let snapshot = adapter.snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.state, RestTransportState::Idle);
    }

    #[tokio::test]
    async fn scripted_failures_are_reported_and_recorded() {
        let adapter =
            MockRestAdapter::with_behavior(MockBehavior::connect_error("dns", None, true));
        let err = adapter
            .execute(RequestId::next(), RestRequest::get("https://api.example.com/b"))
            .await
            .expect_err("connect failure scripted");
        assert_eq!(err.kind(), RestErrorKind::Connect);

        let snapshot = adapter.snapshot();
        assert_eq!(snapshot.state, RestTransportState::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("dns"));
    }

    #[tokio::test]
    async fn behavior_plan_is_consumed_in_order() {
        let mut plan = MockBehaviorPlan::default();
        plan.push(MockBehavior::send_error("broken pipe", None, true))
            .push(MockBehavior::receive_error("reset", Some(502), true))
            .push(MockBehavior::drop_response());
        let adapter = MockRestAdapter::with_behavior_plan(plan);
        adapter.queue_post_response("https://api.example.com/c", MockResponse::text(202, "queued"));

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let err = adapter
                .execute(RequestId::next(), RestRequest::post("https://api.example.com/c"))
                .await
                .expect_err("scripted failure");
            kinds.push((err.kind(), err.status()));
        }
        assert_eq!(
            kinds,
            vec![
                (RestErrorKind::Send, None),
                (RestErrorKind::Receive, Some(502)),
                (RestErrorKind::Timeout, None),
            ]
        );

        let routed = adapter
            .execute(RequestId::next(), RestRequest::post("https://api.example.com/c"))
            .await
            .expect("plan exhausted, route queue answers");
        assert_eq!(routed.status, 202);
        assert_eq!(routed.body(), b"queued");
        assert_eq!(adapter.snapshot().behavior_remaining, 0);
    }

    #[test]
    fn behavior_plan_falls_back_to_pass_when_empty() {
        let mut plan = MockBehaviorPlan::default();
        assert!(plan.is_empty());
        plan.push(MockBehavior::delay(1));
        assert!(!plan.is_empty());
        assert!(matches!(plan.pop(), MockBehavior::Delay(_)));
        assert!(matches!(plan.pop(), MockBehavior::Pass));
        assert!(plan.is_empty());
    }

    #[test]
    fn cancel_is_recorded() {
        let adapter = MockRestAdapter::new();
        let id = RequestId::next();
        adapter.cancel(id);
        assert_eq!(adapter.cancelled(), vec![id]);
    }
}
