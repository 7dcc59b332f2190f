use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::artifacts::DiskArtifactStore;
use crate::config::RunnerConfig;
use crate::interpreter::Interpreter;
use crate::session::{ChromiumLauncher, Executor, SessionLauncher};
use crate::step::Step;

#[derive(Clone)]
pub struct AppState {
    executor: Executor,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(executor: Executor, http: reqwest::Client) -> Self {
        Self { executor, http }
    }

    /// Wires the Chromium launcher and optional artifact store from `cfg`.
    pub fn from_config(cfg: &RunnerConfig) -> anyhow::Result<Self> {
        let launcher: Arc<dyn SessionLauncher> = Arc::new(ChromiumLauncher::new(cfg.browser.clone()));
        let mut executor = Executor::new(launcher, Interpreter::new(cfg.interpreter.clone()), cfg.run_timeout)
            .with_close_timeout(cfg.close_timeout);
        if let Some(dir) = &cfg.artifacts_dir {
            executor = executor.with_artifacts(Arc::new(DiskArtifactStore::new(dir)));
        }
        let http = reqwest::Client::builder().timeout(cfg.proxy_timeout).build()?;
        Ok(Self::new(executor, http))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/run-api", post(run_api_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(cfg: RunnerConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&cfg)?;
    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    info!("automation server listening on http://{}", cfg.addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ========================= /run =========================

async fn run_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let steps = match parse_manifest(&body) {
        Ok(steps) => steps,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    let headless = body.get("headless").and_then(Value::as_bool).unwrap_or(true);

    match state.executor.execute(steps, headless).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            warn!(error = %e, "run could not be executed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "failed", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Validates the request body before any browser is launched.
fn parse_manifest(body: &Value) -> Result<Vec<Step>, String> {
    let Some(raw) = body.get("steps").and_then(Value::as_array) else {
        return Err("steps must be an array".to_string());
    };
    if raw.is_empty() {
        return Err("steps must not be empty".to_string());
    }
    raw.iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value::<Step>(v.clone()).map_err(|e| format!("invalid step {}: {}", i + 1, e))
        })
        .collect()
}

// ========================= /run-api =========================

#[derive(Debug, Deserialize)]
struct ApiRequest {
    #[serde(default)]
    method: Option<String>,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

async fn run_api_handler(State(state): State<AppState>, Json(req): Json<ApiRequest>) -> Response {
    let method = req.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let Ok(method) = Method::from_bytes(method.as_bytes()) else {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid method {method:?}"));
    };
    let url = match Url::parse(&req.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return error_response(StatusCode::BAD_REQUEST, format!("invalid url {:?}", req.url)),
    };
    let mut headers = HeaderMap::new();
    for (k, v) in &req.headers {
        match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => return error_response(StatusCode::BAD_REQUEST, format!("invalid header {k:?}")),
        }
    }

    let mut builder = state.http.request(method.clone(), url.clone()).headers(headers);
    builder = match req.body {
        None | Some(Value::Null) => builder,
        Some(Value::String(text)) => builder.body(text),
        Some(other) => builder.json(&other),
    };

    let started = Instant::now();
    let resp = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%method, %url, error = %e, "proxied request failed");
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };
    let status = resp.status().as_u16();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let resp_headers: BTreeMap<String, String> = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let text = match resp.text().await {
        Ok(text) => text,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    };
    let body = if is_json {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    } else {
        Value::String(text)
    };

    Json(json!({
        "status": status,
        "headers": resp_headers,
        "body": body,
        "durationMs": started.elapsed().as_millis() as u64,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_must_be_a_non_empty_array() {
        assert_eq!(parse_manifest(&json!({})).unwrap_err(), "steps must be an array");
        assert_eq!(parse_manifest(&json!({"steps": "x"})).unwrap_err(), "steps must be an array");
        assert_eq!(parse_manifest(&json!({"steps": []})).unwrap_err(), "steps must not be empty");
    }

    #[test]
    fn invalid_step_is_named() {
        let err = parse_manifest(&json!({"steps": [{"type": "CLICK", "id": "a"}, {"type": "CLICK"}]})).unwrap_err();
        assert!(err.starts_with("invalid step 2"), "{err}");
    }

    #[test]
    fn valid_manifest_parses_in_order() {
        let steps = parse_manifest(&json!({"steps": [
            {"type": "CLICK", "id": "login-btn", "url": "https://app.test"},
            {"type": "ASSERT_URL", "value": "/dashboard"}
        ]}))
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].url.as_deref(), Some("https://app.test"));
    }
}
