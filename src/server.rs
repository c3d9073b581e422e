//! HTTP surface and admission control (§4.5).
//!
//! A minimal service: `/health`, `/ready`, and `/execute`. Size and
//! per-IP-rate-limit admission run in front of every route except `/health`.

use crate::config::Config;
use crate::engine::run_workflow;
use crate::handlers::{self, BlockHandler, HandlerDeps};
use crate::model::{parse_workflow_document, WorkflowDocument};
use axum::{
    extract::{ConnectInfo, Json, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type RateLimitMap = Mutex<HashMap<IpAddr, VecDeque<Instant>>>;

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub workflow: Arc<Option<WorkflowDocument>>,
    pub registry: Arc<Vec<Box<dyn BlockHandler>>>,
    pub warnings: Arc<Vec<String>>,
    pub start_time: Instant,
    pub rate_limiter: Arc<RateLimitMap>,
}

/// Loads the workflow document from `path`, accepting the plain or
/// `{state: {...}}`-wrapped shape. Failures become a startup warning rather
/// than a hard error - the server still starts, degraded (§4.5, §7).
fn load_workflow(path: &str) -> (Option<WorkflowDocument>, Option<String>) {
    let raw = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => return (None, Some(format!("failed to read workflow file '{path}': {e}"))),
    };
    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => return (None, Some(format!("failed to parse workflow file '{path}': {e}"))),
    };
    match parse_workflow_document(&parsed) {
        Ok(doc) => (Some(doc), None),
        Err(e) => (None, Some(format!("failed to build workflow graph: {e}"))),
    }
}

pub fn build_state(config: Config) -> ServerState {
    let (workflow, load_warning) = load_workflow(&config.workflow_path);
    let mut warnings = config.validate_environment();
    if let Some(w) = load_warning {
        warnings.push(w);
    }
    for warning in &warnings {
        warn!("{warning}");
    }

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client");

    ServerState {
        config: Arc::new(config),
        http_client,
        workflow: Arc::new(workflow),
        registry: Arc::new(handlers::build_registry()),
        warnings: Arc::new(warnings),
        start_time: Instant::now(),
        rate_limiter: Arc::new(Mutex::new(HashMap::new())),
    }
}

pub fn build_router(state: ServerState) -> Router {
    let admitted = Router::new()
        .route("/ready", get(ready_handler))
        .route("/execute", post(execute_handler))
        .layer(middleware::from_fn_with_state(state.clone(), admission_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .merge(admitted)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let workflow_loaded = state.workflow.is_some();
    let degraded = !state.warnings.is_empty() || !workflow_loaded;
    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "workflow_loaded": workflow_loaded,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "warnings": state.warnings.as_slice(),
        "workspace": state.config.workspace_dir.as_ref().map(|p| p.display().to_string()),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn ready_handler(State(state): State<ServerState>) -> impl IntoResponse {
    if state.workflow.is_some() {
        (StatusCode::OK, Json(json!({"ready": true})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false})))
    }
}

async fn execute_handler(State(state): State<ServerState>, Json(body): Json<Value>) -> Response {
    let workflow = match state.workflow.as_ref() {
        Some(w) => w,
        None => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "no workflow loaded"}))).into_response()
        }
    };

    let inputs = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    let workflow_variables = state.config.seed_workflow_variables();
    let deps = HandlerDeps {
        http_client: state.http_client.clone(),
        config: state.config.clone(),
    };

    let result = run_workflow(workflow, &state.registry, &deps, inputs, workflow_variables).await;
    Json(json!({
        "success": result.success,
        "output": result.output,
        "error": result.error,
        "logs": result.logs,
    }))
    .into_response()
}

/// Request-size cap (413) and per-IP sliding-window rate limit (429 +
/// `Retry-After`). Entries older than the window are pruned before each check.
async fn admission_middleware(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(len) = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if len > state.config.max_request_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": format!("request body exceeds {} bytes", state.config.max_request_size)})),
            )
                .into_response();
        }
    }

    if let Some(retry_after) = check_rate_limit(&state, addr.ip()) {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limit exceeded", "retryAfter": retry_after})),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_str(&retry_after.to_string()).unwrap());
        return response;
    }

    next.run(request).await
}

/// Returns `Some(retry_after_secs)` when `ip` has exceeded its window quota.
fn check_rate_limit(state: &ServerState, ip: IpAddr) -> Option<u64> {
    let window = Duration::from_secs(state.config.rate_limit_window_secs.max(1));
    let now = Instant::now();
    let mut map = state.rate_limiter.lock().expect("rate limiter mutex poisoned");
    let entries = map.entry(ip).or_default();

    while let Some(&oldest) = entries.front() {
        if now.duration_since(oldest) > window {
            entries.pop_front();
        } else {
            break;
        }
    }

    if entries.len() as u32 >= state.config.rate_limit_requests {
        let oldest = *entries.front().unwrap();
        let elapsed = now.duration_since(oldest);
        let retry_after = window.saturating_sub(elapsed).as_secs().max(1).min(state.config.rate_limit_window_secs.max(1));
        Some(retry_after)
    } else {
        entries.push_back(now);
        None
    }
}

pub async fn serve(config: Config) {
    let state = build_state(config);
    info!("workflow loaded: {}", state.workflow.is_some());
    let bind_addr = state.config.bind_addr();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));

    info!("listening on {bind_addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState {
            config: Arc::new(Config::from_env()),
            http_client: reqwest::Client::new(),
            workflow: Arc::new(None),
            registry: Arc::new(handlers::build_registry()),
            warnings: Arc::new(Vec::new()),
            start_time: Instant::now(),
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[test]
    fn rate_limit_admits_up_to_the_configured_quota() {
        let mut s = state();
        Arc::get_mut(&mut s.config).unwrap().rate_limit_requests = 3;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(check_rate_limit(&s, ip).is_none());
        assert!(check_rate_limit(&s, ip).is_none());
        assert!(check_rate_limit(&s, ip).is_none());
        assert!(check_rate_limit(&s, ip).is_some());
    }

    #[test]
    fn different_ips_have_independent_windows() {
        let mut s = state();
        Arc::get_mut(&mut s.config).unwrap().rate_limit_requests = 1;
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(check_rate_limit(&s, a).is_none());
        assert!(check_rate_limit(&s, a).is_some());
        assert!(check_rate_limit(&s, b).is_none());
    }
}
