use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use shared_request_funnel::{
    BoxError, Client, FunnelConfig, PreparedRequest, ReqwestTransport, RestErrorKind, RestRequest,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::sleep;

#[derive(Debug, serde::Deserialize)]
struct RpcResponse<T> {
    jsonrpc: String,
    id: u64,
    result: T,
}

#[derive(Debug, serde::Deserialize)]
struct OkResult {
    ok: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("server said: {0}")]
struct ServerSaid(String);

#[tokio::test]
async fn e2e_jsonrpc_success_roundtrip() {
    let server = TestServer::start().await;
    let client = Client::with_transport(ReqwestTransport::new());

    let response: RpcResponse<OkResult> = client
        .to_value(&PreparedRequest::value(
            RestRequest::post(server.url("/jsonrpc/ok"))
                .with_json(&rpc_payload())
                .expect("payload should encode"),
        ))
        .await
        .expect("jsonrpc response should parse");

    assert_eq!(response.jsonrpc, "2.0");
    assert_eq!(response.id, 1);
    assert!(response.result.ok);
}

#[tokio::test]
async fn e2e_no_content_is_an_empty_success() {
    let server = TestServer::start().await;
    let client = Client::with_transport(ReqwestTransport::new());

    client
        .to_empty(&PreparedRequest::empty(RestRequest::post(server.url("/ack"))))
        .await
        .expect("204 should succeed without a body");
}

#[tokio::test]
async fn e2e_error_status_goes_through_the_mapper() {
    let server = TestServer::start().await;
    let config = FunnelConfig::builder()
        .error_mapper(|err, body| {
            let body = body?;
            (err.status() == Some(503)).then(|| {
                Box::new(ServerSaid(String::from_utf8_lossy(body).into_owned())) as BoxError
            })
        })
        .build();
    let client = Client::with_config(ReqwestTransport::new(), config);

    let err = client
        .to_raw(&PreparedRequest::raw(RestRequest::get(server.url("/unavailable"))))
        .await
        .expect_err("503 is not acceptable");
    let said = err.downcast_mapped::<ServerSaid>().expect("mapper should have run");
    assert_eq!(said.0, "service unavailable");
}

#[tokio::test]
async fn e2e_explicit_timeout_is_reported_as_timeout() {
    let server = TestServer::start().await;
    let client = Client::with_transport(ReqwestTransport::new());

    let err = client
        .to_raw(&PreparedRequest::raw(
            RestRequest::get(server.url("/slow")).with_timeout(Duration::from_millis(200)),
        ))
        .await
        .expect_err("explicit timeout should trigger");

    assert_eq!(err.as_transport().map(|e| e.kind()), Some(RestErrorKind::Timeout));
}

#[tokio::test]
async fn e2e_disposing_a_single_aborts_the_exchange() {
    let server = TestServer::start().await;
    let transport = ReqwestTransport::new();
    let client = Client::with_transport(transport.clone());
    let (tx, rx) = oneshot::channel::<()>();

    let subscription = client
        .raw_single(PreparedRequest::raw(RestRequest::get(server.url("/slow"))))
        .subscribe(move |_| {
            let _ = tx.send(());
        });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.in_flight(), 1);

    assert!(subscription.dispose());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.in_flight(), 0);
    assert!(
        rx.await.is_err(),
        "a disposed subscription drops its observer without notifying it"
    );
}

fn rpc_payload() -> std::collections::BTreeMap<&'static str, &'static str> {
    std::collections::BTreeMap::from([("jsonrpc", "2.0"), ("method", "ok")])
}

struct TestServer {
    base_url: String,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let app = Router::new()
            .route("/jsonrpc/ok", post(ok_handler))
            .route("/ack", post(ack_handler))
            .route("/unavailable", get(unavailable_handler))
            .route("/slow", get(slow_handler));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { base_url, task }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn ok_handler() -> (StatusCode, &'static str) {
    (
        StatusCode::OK,
        r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#,
    )
}

async fn ack_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn unavailable_handler() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
}

async fn slow_handler() -> (StatusCode, &'static str) {
    sleep(Duration::from_millis(2500)).await;
    (StatusCode::OK, "finally")
}
