//! End-to-end tests: a live gateway in front of in-process mock upstreams.
//!
//! Mock upstreams listen on loopback, so the gateway runs with
//! `ssrf.allow_private_networks = true`. Mocks echo what they received so
//! assertions stay on the client side of the wire.

use bytes::Bytes;
use charon_gateway::auth::hash_secret;
use charon_gateway::billing::SpendLedger;
use charon_gateway::config::GatewayConfig;
use charon_gateway::control::FileControlPlane;
use charon_gateway::metrics::Metrics;
use charon_gateway::proxy;
use charon_gateway::server::GatewayState;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;

const TEST_KEY: &str = "sk-ch-1-integration-secret";

fn metrics() -> Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::install).clone()
}

/// A scripted mock upstream. The handler sees every proxied request and
/// decides the response; requests are counted.
struct MockUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicU32>,
}

async fn spawn_mock<F, Fut>(handler: F) -> MockUpstream
where
    F: Fn(u32, Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let handler = Arc::new(handler);

    let hits_accept = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            let hits = hits_accept.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let hit = hits.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, hyper::Error>(handler(hit, req).await) }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, svc)
                    .await;
            });
        }
    });

    MockUpstream { addr, hits }
}

/// Echo mock: returns what it saw — the model, the credential it was given,
/// whether a request id arrived — plus a usage block.
async fn spawn_echo_mock() -> MockUpstream {
    spawn_mock(|_, req| async move {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let gateway_key_leaked = req.headers().contains_key("x-api-key");
        let has_request_id = req.headers().contains_key("x-request-id");
        let path = req.uri().path().to_string();
        let bytes = req.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_default();
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();

        let payload = serde_json::json!({
            "echo": {
                "authorization": auth,
                "gateway_key_leaked": gateway_key_leaked,
                "has_request_id": has_request_id,
                "path": path,
                "model": model,
            },
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
            .unwrap()
    })
    .await
}

async fn spawn_status_mock(status: u16, body: &'static str) -> MockUpstream {
    spawn_mock(move |_, _| async move {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    })
    .await
}

struct TestGateway {
    addr: SocketAddr,
    _control_file: TempFile,
}

struct TempFile(std::path::PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Boot a gateway around the given control-file body and serve it on an
/// ephemeral loopback port.
async fn spawn_gateway(control_toml: String) -> TestGateway {
    let path = std::env::temp_dir().join(format!(
        "charon_it_{}_{}.toml",
        std::process::id(),
        uuid::Uuid::new_v4()
    ));
    std::fs::write(&path, control_toml).unwrap();

    let mut config = GatewayConfig::default();
    config.ssrf.allow_private_networks = true;
    config.control.file = path.to_string_lossy().to_string();
    config.limits.max_body_bytes = 64 * 1024;

    let ledger = Arc::new(SpendLedger::new());
    let control = FileControlPlane::load(&path, ledger.clone()).unwrap();
    let state = GatewayState::new(config, control, ledger, metrics());
    state.start_background_tasks();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move { proxy::handle_request(req, state, peer).await }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, svc)
                    .await;
            });
        }
    });

    TestGateway {
        addr,
        _control_file: TempFile(path),
    }
}

fn control_file_two_upstreams(primary: SocketAddr, backup: SocketAddr) -> String {
    format!(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "http://{primary}"
capabilities = ["openai_chat_compatible"]
provider_type = "openai"
credential = "sk-upstream-primary"
weight = 1

[[upstreams]]
id = "u2"
name = "backup"
base_url = "http://{backup}"
capabilities = ["openai_chat_compatible"]
provider_type = "openai"
credential = "sk-upstream-backup"
priority = 1

[[api_keys]]
id = "k1"
key_hash = "{hash}"
key_prefix = "sk-ch-1"
upstream_ids = ["u1", "u2"]

[[prices]]
model = "gpt-4o"
input_per_million = 2.5
output_per_million = 10.0
"#,
        primary = primary,
        backup = backup,
        hash = hash_secret(TEST_KEY),
    )
}

type TestClient = Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>;

fn client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

fn chat_request(gateway: SocketAddr, key: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("http://{gateway}/proxy/v1/chat/completions"))
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn read_body(response: Response<Incoming>) -> (StatusCode, http::HeaderMap, Bytes) {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

#[tokio::test]
async fn happy_path_rewrites_credentials_and_relays() {
    let upstream = spawn_echo_mock().await;
    let idle = spawn_echo_mock().await;

    let gw = spawn_gateway(control_file_two_upstreams(upstream.addr, idle.addr)).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hello"}]}"#,
        ))
        .await
        .unwrap();
    let (status, headers, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-request-id").is_some());

    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    // The gateway key never reaches the upstream; the upstream credential
    // is injected instead.
    assert_eq!(v["echo"]["authorization"], "Bearer sk-upstream-primary");
    assert_eq!(v["echo"]["gateway_key_leaked"], false);
    assert_eq!(v["echo"]["has_request_id"], true);
    assert_eq!(v["echo"]["path"], "/v1/chat/completions");
    assert_eq!(v["usage"]["total_tokens"], 15);

    // Tier-0 served it; the reserve tier was never consulted.
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
    assert_eq!(idle.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failover_on_500_reaches_backup() {
    let failing = spawn_status_mock(500, r#"{"error":"exploded"}"#).await;
    let backup = spawn_echo_mock().await;

    let gw = spawn_gateway(control_file_two_upstreams(failing.addr, backup.addr)).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["echo"]["authorization"], "Bearer sk-upstream-backup");
    assert_eq!(failing.hits.load(Ordering::SeqCst), 1);
    assert_eq!(backup.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fatal_4xx_is_returned_verbatim_without_failover() {
    let rejecting = spawn_status_mock(422, r#"{"error":{"message":"bad schema"}}"#).await;
    let backup = spawn_echo_mock().await;

    let gw = spawn_gateway(control_file_two_upstreams(rejecting.addr, backup.addr)).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["message"], "bad schema");
    // The 4xx belongs to the caller — the backup is never consulted.
    assert_eq!(backup.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_upstreams_down_yields_canonical_503() {
    let failing = spawn_status_mock(503, "down").await;
    let also_failing = spawn_status_mock(502, "down").await;

    let gw = spawn_gateway(control_file_two_upstreams(failing.addr, also_failing.addr)).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "ALL_UPSTREAMS_UNAVAILABLE");
    assert_eq!(v["error"]["did_send_upstream"], true);
    // Both tiers were tried exactly once.
    assert_eq!(failing.hits.load(Ordering::SeqCst), 1);
    assert_eq!(also_failing.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_key_is_401_envelope() {
    let upstream = spawn_echo_mock().await;
    let other = spawn_echo_mock().await;
    let gw = spawn_gateway(control_file_two_upstreams(upstream.addr, other.addr)).await;

    let response = client()
        .request(chat_request(gw.addr, None, r#"{"model":"gpt-4o"}"#))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "UNAUTHORIZED");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let upstream = spawn_echo_mock().await;
    let other = spawn_echo_mock().await;
    let gw = spawn_gateway(control_file_two_upstreams(upstream.addr, other.addr)).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{}/proxy/v9/unknown", gw.addr))
        .header("authorization", format!("Bearer {TEST_KEY}"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(r#"{"model":"llama-3"}"#)))
        .unwrap();
    let response = client().request(request).await.unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "UNSUPPORTED_ROUTE");
}

#[tokio::test]
async fn oversized_body_is_413_before_any_upstream() {
    let upstream = spawn_echo_mock().await;
    let other = spawn_echo_mock().await;
    let gw = spawn_gateway(control_file_two_upstreams(upstream.addr, other.addr)).await;

    // Gateway configured with a 64 KiB cap; send 128 KiB.
    let big = format!(
        r#"{{"model":"gpt-4o","messages":[{{"role":"user","content":"{}"}}]}}"#,
        "x".repeat(128 * 1024)
    );
    let response = client()
        .request(chat_request(gw.addr, Some(TEST_KEY), &big))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
    assert_eq!(other.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sse_stream_relays_frames_unchanged() {
    const FRAMES: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}],\"usage\":null}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}],\"usage\":null}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = spawn_mock(|_, _| async move {
        Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .body(Full::new(Bytes::from(FRAMES)))
            .unwrap()
    })
    .await;
    let other = spawn_echo_mock().await;

    let gw = spawn_gateway(control_file_two_upstreams(upstream.addr, other.addr)).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[],"stream":true}"#,
        ))
        .await
        .unwrap();
    let (status, headers, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    // Byte-for-byte passthrough, no re-framing.
    assert_eq!(body, Bytes::from(FRAMES));
}

#[tokio::test]
async fn pinned_upstream_defeats_load_balancing() {
    let primary = spawn_echo_mock().await;
    let backup = spawn_echo_mock().await;
    let gw = spawn_gateway(control_file_two_upstreams(primary.addr, backup.addr)).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{}/proxy/v1/chat/completions", gw.addr))
        .header("authorization", format!("Bearer {TEST_KEY}"))
        .header("content-type", "application/json")
        .header("x-upstream-name", "backup")
        .body(Full::new(Bytes::from(r#"{"model":"gpt-4o","messages":[]}"#)))
        .unwrap();
    let response = client().request(request).await.unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["echo"]["authorization"], "Bearer sk-upstream-backup");
    assert_eq!(primary.hits.load(Ordering::SeqCst), 0);
    assert_eq!(backup.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pin_to_unknown_upstream_is_400() {
    let primary = spawn_echo_mock().await;
    let backup = spawn_echo_mock().await;
    let gw = spawn_gateway(control_file_two_upstreams(primary.addr, backup.addr)).await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{}/proxy/v1/chat/completions", gw.addr))
        .header("authorization", format!("Bearer {TEST_KEY}"))
        .header("content-type", "application/json")
        .header("x-upstream-name", "does-not-exist")
        .body(Full::new(Bytes::from(r#"{"model":"gpt-4o","messages":[]}"#)))
        .unwrap();
    let response = client().request(request).await.unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "UPSTREAM_PIN_INCOMPATIBLE");
}

#[tokio::test]
async fn model_redirect_rewrites_outbound_body() {
    let upstream = spawn_echo_mock().await;
    let other = spawn_echo_mock().await;

    let control = control_file_two_upstreams(upstream.addr, other.addr).replace(
        "credential = \"sk-upstream-primary\"\nweight = 1",
        "credential = \"sk-upstream-primary\"\nweight = 1\n\n[upstreams.model_redirects]\n\"gpt-4o\" = \"gpt-4o-mini\"",
    );
    let gw = spawn_gateway(control).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["echo"]["model"], "gpt-4o-mini");
}

#[tokio::test]
async fn key_without_authorized_upstreams_is_403() {
    let upstream = spawn_echo_mock().await;
    let other = spawn_echo_mock().await;

    let control = control_file_two_upstreams(upstream.addr, other.addr)
        .replace("upstream_ids = [\"u1\", \"u2\"]", "upstream_ids = []");
    let gw = spawn_gateway(control).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["error"]["code"], "NO_AUTHORIZED_UPSTREAMS");
}

#[tokio::test]
async fn inactive_upstream_excluded_from_rotation() {
    let primary = spawn_echo_mock().await;
    let backup = spawn_echo_mock().await;

    let control = control_file_two_upstreams(primary.addr, backup.addr).replace(
        "credential = \"sk-upstream-primary\"\nweight = 1",
        "credential = \"sk-upstream-primary\"\nweight = 1\nis_active = false",
    );
    let gw = spawn_gateway(control).await;

    let response = client()
        .request(chat_request(
            gw.addr,
            Some(TEST_KEY),
            r#"{"model":"gpt-4o","messages":[]}"#,
        ))
        .await
        .unwrap();
    let (status, _, body) = read_body(response).await;

    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["echo"]["authorization"], "Bearer sk-upstream-backup");
    assert_eq!(primary.hits.load(Ordering::SeqCst), 0);
}
