//! HTTP frontend: the admin/browser-facing dashboard, the task dispatch
//! API, and the admin config/health/stats surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use concierge_core::error::ConciergeError;
use concierge_core::plan::PlanScheduler;
use concierge_core::task::TaskDispatcher;
use concierge_core::ws::TokenIssuer;

const INDEX_TEMPLATE: &str = include_str!("../assets/index.html");
const OPENAPI_SPEC: &str = include_str!("../assets/openapi.yaml");

pub struct AppState {
    pub dispatcher: Arc<TaskDispatcher>,
    pub token_issuer: Arc<TokenIssuer>,
    pub api_key: String,
    pub admin_key: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/abort", post(abort_task))
        .route("/ws/token", get(issue_ws_token))
        .route("/wakeup", post(wakeup))
        .route("/wakeup/{host}", post(wakeup_one))
        .route("/commands/{name}", post(run_command))
        .route("/commands/{name}/{host}", post(run_command_one))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let admin = Router::new()
        .route("/config", get(get_config).put(put_config))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/concierge", get(index))
        .route("/concierge/openapi.yaml", get(openapi))
        .nest("/concierge/api/v1", api)
        .nest("/admin", admin)
        .with_state(state)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_api_key(State(state): State<Arc<AppState>>, headers: HeaderMap, req: axum::extract::Request, next: Next) -> Response {
    match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(key) if constant_time_eq(key, &state.api_key) => next.run(req).await,
        _ => error_response(401, "missing or invalid X-API-Key"),
    }
}

async fn require_admin_key(State(state): State<Arc<AppState>>, headers: HeaderMap, req: axum::extract::Request, next: Next) -> Response {
    if state.admin_key.is_empty() {
        return error_response(503, "admin interface disabled: no admin key configured");
    }
    match headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        Some(key) if constant_time_eq(key, &state.admin_key) => next.run(req).await,
        _ => error_response(401, "missing or invalid X-Admin-Key"),
    }
}

fn error_response(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": message}))).into_response()
}

fn concierge_error_response(err: ConciergeError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.dispatcher.render_html(INDEX_TEMPLATE))
}

async fn openapi() -> impl IntoResponse {
    ([("content-type", "application/yaml")], OPENAPI_SPEC)
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Value>> {
    Json(state.dispatcher.list_tasks().iter().map(|t| serde_json::to_value(t).unwrap_or(Value::Null)).collect())
}

async fn get_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match state.dispatcher.get_task(&id) {
        Some(task) => Json(task).into_response(),
        None => error_response(404, &format!("no task '{id}'")),
    }
}

#[derive(Deserialize)]
struct AbortBody {
    hostname: Option<String>,
}

async fn abort_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>, Json(body): Json<AbortBody>) -> Response {
    let Some(task) = state.dispatcher.get_task(&id) else {
        return error_response(404, &format!("no task '{id}'"));
    };
    let targets: Vec<String> = match body.hostname {
        Some(h) => vec![h],
        None => task.hosts,
    };
    let aborted: Vec<String> = targets.into_iter().filter(|h| state.dispatcher.abort(&id, h)).collect();
    Json(json!({"aborted": aborted})).into_response()
}

#[derive(Deserialize)]
struct WsTokenQuery {
    task_id: String,
    hostname: String,
    #[serde(default = "default_ttl_secs")]
    ttl_secs: u64,
    #[serde(default = "default_user")]
    user: String,
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_user() -> String {
    "anonymous".to_string()
}

async fn issue_ws_token(State(state): State<Arc<AppState>>, Query(q): Query<WsTokenQuery>) -> Response {
    let Some(task) = state.dispatcher.get_task(&q.task_id) else {
        return error_response(404, &format!("no task '{}'", q.task_id));
    };
    let socket_raw_mode = task.command.as_deref().and_then(|name| state.dispatcher.socket_raw_mode_for(name));

    let now = unix_now();
    let token = state
        .token_issuer
        .issue(&q.user, &q.task_id, &q.hostname, Duration::from_secs(q.ttl_secs), now);
    Json(json!({
        "token": token,
        "expires_in": q.ttl_secs,
        "socket_raw_mode": socket_raw_mode,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct HostsBody {
    hosts: Vec<String>,
}

async fn wakeup(State(state): State<Arc<AppState>>, Json(body): Json<HostsBody>) -> Response {
    dispatch_response(state.dispatcher.wakeup(&body.hosts).await)
}

async fn wakeup_one(State(state): State<Arc<AppState>>, AxumPath(host): AxumPath<String>) -> Response {
    dispatch_response(state.dispatcher.wakeup(&[host]).await)
}

#[derive(Deserialize, Default)]
struct CommandBody {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    params: HashMap<String, Value>,
}

async fn run_command(State(state): State<Arc<AppState>>, AxumPath(name): AxumPath<String>, Json(body): Json<CommandBody>) -> Response {
    if state.dispatcher.is_plan(&name) {
        return dispatch_response(PlanScheduler::start(state.dispatcher.clone(), &name));
    }
    dispatch_response(state.dispatcher.command(&name, &body.hosts, body.params).await)
}

async fn run_command_one(
    State(state): State<Arc<AppState>>,
    AxumPath((name, host)): AxumPath<(String, String)>,
    body: Option<Json<CommandBody>>,
) -> Response {
    if state.dispatcher.is_plan(&name) {
        return dispatch_response(PlanScheduler::start(state.dispatcher.clone(), &name));
    }
    let params = body.map(|Json(b)| b.params).unwrap_or_default();
    dispatch_response(state.dispatcher.command(&name, &[host], params).await)
}

fn dispatch_response(result: Result<concierge_core::task::Task, ConciergeError>) -> Response {
    match result {
        Ok(task) => {
            let status = StatusCode::from_u16(task.response_status()).unwrap_or(StatusCode::OK);
            (status, Json(task)).into_response()
        }
        Err(e) => concierge_error_response(e),
    }
}

async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher.config_source_bytes() {
        Ok(bytes) => ([("content-type", "application/json")], bytes).into_response(),
        Err(e) => concierge_error_response(e),
    }
}

async fn put_config(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
    match state.dispatcher.replace_config(&body) {
        Ok(()) => Json(json!({"status": "replaced"})).into_response(),
        Err(e) => concierge_error_response(e),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn stats() -> Response {
    match concierge_core::sysinfo::get_process_info() {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(500, &e.to_string()),
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
