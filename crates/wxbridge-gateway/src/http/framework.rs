//! Framework control surface: command execution, scheduler task CRUD,
//! plugin status, chat-mode toggle, health and stability introspection.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use wxbridge_core::types::InboundMessage;
use wxbridge_plugins::builtin;
use wxbridge_scheduler::SchedulerError;

use crate::app::AppState;

fn not_found(detail: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

fn bad_request(detail: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
}

#[derive(Deserialize)]
pub struct ExecuteBody {
    command: String,
    #[serde(default)]
    send_back: bool,
}

/// POST /framework/execute — run a command through the dispatcher (chat
/// fallback disabled); optionally send the reply upstream.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    if body.command.trim().is_empty() {
        return bad_request("command is required");
    }

    let msg = InboundMessage::text(
        format!("exec-{}", chrono::Utc::now().timestamp_millis()),
        body.command.clone(),
        false,
    );
    let reply = state.dispatcher.dispatch(&msg, false).await;

    if body.send_back {
        if let Some(reply) = &reply {
            if let Err(e) = state.engine.send_text(reply).await {
                warn!("execute send-back failed: {e}");
            }
        }
    }

    Json(json!({ "command": body.command, "reply": reply })).into_response()
}

/// GET /framework/tasks
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "tasks": state.scheduler.list_tasks() }))
}

#[derive(Deserialize)]
pub struct AddTaskBody {
    time: String,
    command: String,
    #[serde(default)]
    description: String,
}

/// POST /framework/tasks
pub async fn add_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddTaskBody>,
) -> Response {
    match state
        .scheduler
        .add_task(&body.time, &body.command, &body.description)
    {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(e @ SchedulerError::InvalidTime(_)) => bad_request(&e.to_string()),
        Err(e) => bad_request(&e.to_string()),
    }
}

/// DELETE /framework/tasks/{id}
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.delete_task(&id) {
        Ok(()) => Json(json!({ "deleted": id })).into_response(),
        Err(SchedulerError::TaskNotFound { .. }) => not_found("task not found"),
        Err(e) => bad_request(&e.to_string()),
    }
}

/// POST /framework/tasks/{id}/run — manual run, bypasses the daily gate.
pub async fn run_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.run_task_now(&id).await {
        Ok(reply) => Json(json!({ "task": id, "reply": reply })).into_response(),
        Err(SchedulerError::TaskNotFound { .. }) => not_found("task not found"),
        Err(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": e.to_string() })))
                .into_response()
        }
    }
}

/// POST /framework/tasks/{id}/toggle
pub async fn toggle_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.scheduler.toggle_task(&id) {
        Ok(task) => Json(json!({ "task": task })).into_response(),
        Err(SchedulerError::TaskNotFound { .. }) => not_found("task not found"),
        Err(e) => bad_request(&e.to_string()),
    }
}

/// GET /plugins
pub async fn plugins_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.registry.status())
}

/// POST /plugins/reload — clear the registry and re-run every plugin's
/// registration, then the load hooks.
pub async fn plugins_reload(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.registry.reload(builtin::plugins(), &state.plugin_deps);
    state.registry.run_load_hooks().await;
    Json(state.registry.status())
}

/// GET /chat-mode
pub async fn chat_mode_get(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "enabled": state.dispatcher.chat_mode() }))
}

#[derive(Deserialize)]
pub struct ChatModeBody {
    enabled: bool,
}

/// POST /chat-mode
pub async fn chat_mode_set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatModeBody>,
) -> Json<Value> {
    state.dispatcher.set_chat_mode(body.enabled);
    Json(json!({ "enabled": state.dispatcher.chat_mode() }))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "wxbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "server": state.settings.server_label(),
        "logged_in": state.engine.is_logged_in(),
        "uptime_seconds": state.stability.uptime_seconds(),
    }))
}

/// GET /stability — reconnect counter and the bounded error ring.
pub async fn stability(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "is_logged_in": state.engine.is_logged_in(),
        "reconnect_attempts": state.stability.reconnect_attempts(),
        "max_reconnect_attempts": state.settings.max_reconnect_attempts,
        "uptime_seconds": state.stability.uptime_seconds(),
        "errors": state.stability.errors(),
    }))
}
