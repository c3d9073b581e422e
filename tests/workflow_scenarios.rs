//! End-to-end scenario tests for the DAG scheduler and HTTP surface.
//!
//! Each test builds a small workflow document in-process (no file on disk)
//! and drives it through `run_workflow`, or - for the admission-layer tests -
//! through the full `axum::Router` via `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use workflow_engine::config::Config;
use workflow_engine::engine::run_workflow;
use workflow_engine::handlers::{build_registry, HandlerDeps};
use workflow_engine::model::parse_workflow_document;
use workflow_engine::server::{build_router, build_state};

fn deps() -> HandlerDeps {
    HandlerDeps {
        http_client: reqwest::Client::new(),
        config: Arc::new(Config::from_env()),
    }
}

async fn run(doc: &Value, inputs: Map<String, Value>) -> workflow_engine::engine::RunResult {
    let parsed = parse_workflow_document(doc).expect("workflow should parse");
    let registry = build_registry();
    run_workflow(&parsed, &registry, &deps(), inputs, Map::new()).await
}

/// S1 - a linear DAG threads a computed variable from a function block
/// through to the response block.
#[tokio::test]
async fn s1_linear_dag_threads_variable_into_response() {
    let doc = json!({
        "blocks": [
            {"id": "s", "type": "start"},
            {
                "id": "f",
                "type": "function",
                "name": "Compute",
                "inputs": {"code": "__return__ = {\"v\": context['start']['n'] + 1}"}
            },
            {
                "id": "r",
                "type": "response",
                "name": "Out",
                "inputs": {"data": "<compute.v>"}
            }
        ],
        "edges": [
            {"source": "s", "target": "f"},
            {"source": "f", "target": "r"}
        ]
    });

    let mut inputs = Map::new();
    inputs.insert("n".to_string(), json!(41));
    let result = run(&doc, inputs).await;

    assert!(result.success);
    assert_eq!(result.output, json!(42));
}

/// S2 - the router picks the first route whose condition is truthy, in
/// document order, and later routes are never evaluated-as-winners.
#[tokio::test]
async fn s2_router_picks_first_truthy_route() {
    let doc = json!({
        "blocks": [
            {"id": "s", "type": "start"},
            {
                "id": "c",
                "type": "condition",
                "name": "Route",
                "inputs": {
                    "routes": [
                        {"condition": "start['score'] > 100", "name": "huge"},
                        {"condition": "start['score'] > 50", "name": "big"},
                        {"condition": "start['score'] > 0", "name": "small"}
                    ]
                }
            },
            {
                "id": "r",
                "type": "response",
                "name": "Out",
                "inputs": {"data": "<route.branch>"}
            }
        ],
        "edges": [
            {"source": "s", "target": "c"},
            {"source": "c", "target": "r"}
        ]
    });

    let mut inputs = Map::new();
    inputs.insert("score".to_string(), json!(75));
    let result = run(&doc, inputs).await;

    assert!(result.success);
    assert_eq!(result.output, json!("big"));
}

/// S3 - a forEach loop runs once per item and reports every iteration's
/// per-child output map plus a total count.
#[tokio::test]
async fn s3_for_each_loop_runs_every_item_and_reports_total() {
    let doc = json!({
        "blocks": [
            {"id": "s", "type": "start"},
            {
                "id": "l",
                "type": "loop",
                "name": "L",
                "inputs": {"loopType": "forEach", "forEachItems": [10, 20, 30]}
            },
            {
                "id": "c",
                "type": "function",
                "name": "C",
                "parentId": "l",
                "inputs": {"code": "__return__ = {\"v\": context['_loop']['item'] * 2}"}
            },
            {
                "id": "r",
                "type": "response",
                "name": "Out",
                "inputs": {"data": "<l.results>"}
            }
        ],
        "edges": [
            {"source": "s", "target": "l"},
            {"source": "l", "target": "r"}
        ]
    });

    let result = run(&doc, Map::new()).await;
    assert!(result.success);

    let results = result.output.as_array().expect("results should be an array");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["C"]["v"], json!(20));
    assert_eq!(results[1]["C"]["v"], json!(40));
    assert_eq!(results[2]["C"]["v"], json!(60));
}

/// Minimal single-threaded HTTP/1.1 server: replies with a canned status
/// line and body to every connection it accepts, one reply per accept.
async fn serve_responses(responses: Vec<(u16, &'static str)>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status} x\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    format!("http://{addr}")
}

/// S4 - a transient API failure is retried with backoff and eventually
/// recorded as a successful log entry once the upstream recovers.
#[tokio::test]
async fn s4_transient_failure_is_retried_until_success() {
    assert!(workflow_engine::engine::is_transient("upstream returned HTTP 503 for http://x"));
    assert!(!workflow_engine::engine::is_transient("invalid api key"));

    let base_url = serve_responses(vec![
        (503, r#"{"ok": false}"#),
        (503, r#"{"ok": false}"#),
        (200, r#"{"ok": true}"#),
    ])
    .await;

    let doc = json!({
        "blocks": [
            {"id": "s", "type": "start"},
            {
                "id": "a",
                "type": "api",
                "name": "Call",
                "inputs": {"url": base_url, "method": "GET"}
            },
            {
                "id": "r",
                "type": "response",
                "name": "Out",
                "inputs": {"data": "<call.data>"}
            }
        ],
        "edges": [
            {"source": "s", "target": "a"},
            {"source": "a", "target": "r"}
        ]
    });

    let result = run(&doc, Map::new()).await;
    assert!(result.success);
    assert_eq!(result.output, json!({"ok": true}));

    let logs = result.logs.as_array().unwrap();
    let call_log = logs.iter().find(|l| l["blockName"] == "Call").unwrap();
    assert_eq!(call_log["success"], json!(true));
}

/// A non-transient API error status (e.g. a plain 404) is returned as the
/// normal `{status, ok: false, ...}` shape and never retried.
#[tokio::test]
async fn api_non_transient_status_is_not_retried() {
    let base_url = serve_responses(vec![(404, r#"{"detail": "not found"}"#)]).await;

    let doc = json!({
        "blocks": [
            {"id": "s", "type": "start"},
            {
                "id": "a",
                "type": "api",
                "name": "Call",
                "inputs": {"url": base_url, "method": "GET"}
            },
            {
                "id": "r",
                "type": "response",
                "name": "Out",
                "inputs": {"data": "<call>"}
            }
        ],
        "edges": [
            {"source": "s", "target": "a"},
            {"source": "a", "target": "r"}
        ]
    });

    let result = run(&doc, Map::new()).await;
    assert!(result.success);
    assert_eq!(result.output["status"], json!(404));
    assert_eq!(result.output["ok"], json!(false));
}

/// S5 - the sandboxed filesystem tool refuses to escape the workspace root,
/// and writes nothing when it does.
#[tokio::test]
async fn s5_sandbox_escape_is_rejected() {
    let dir = std::env::temp_dir().join(format!("workflow-engine-test-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();

    let tools = workflow_engine::tools::NativeTools::new(dir.clone(), true, 1024 * 1024);
    let result = tools
        .dispatch("local_write_file", &json!({"path": "../escaped.txt", "content": "pwned"}))
        .await;

    assert_eq!(result["success"], json!(false));
    assert!(!dir.parent().unwrap().join("escaped.txt").exists());

    tokio::fs::remove_dir_all(&dir).await.ok();
}

/// S6 - the per-IP sliding-window rate limiter admits exactly the configured
/// quota and then answers with 429 and a `Retry-After` header.
#[tokio::test]
async fn s6_rate_limit_returns_429_after_quota_is_exhausted() {
    let mut config = Config::from_env();
    config.rate_limit_requests = 3;
    config.rate_limit_window_secs = 60;
    config.workflow_path = "definitely-does-not-exist.json".to_string();

    let state = build_state(config);
    let app = build_router(state);

    let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let mut last_status = StatusCode::OK;
    let mut last_retry_after = None;

    for _ in 0..4 {
        let mut request = Request::builder()
            .method("GET")
            .uri("/ready")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));

        let response = app.clone().oneshot(request).await.unwrap();
        last_retry_after = response
            .headers()
            .get("retry-after")
            .map(|v| v.to_str().unwrap().to_string());
        last_status = response.status();
    }

    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
    assert!(last_retry_after.is_some());
}

/// `/health` is never gated by the admission layer, even once a client has
/// exhausted its rate-limit quota on the admitted routes.
#[tokio::test]
async fn health_route_is_never_rate_limited() {
    let mut config = Config::from_env();
    config.rate_limit_requests = 1;
    config.workflow_path = "definitely-does-not-exist.json".to_string();

    let state = build_state(config);
    let app = build_router(state);
    let addr: SocketAddr = "127.0.0.1:9998".parse().unwrap();

    for _ in 0..5 {
        let mut request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

