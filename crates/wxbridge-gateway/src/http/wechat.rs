//! Upstream-specific extension routes: QR login, direct send/upload,
//! session persistence, and trace inspection.

use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use wxbridge_engine::EngineError;

use crate::app::AppState;

fn error_json(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

/// GET / — service descriptor.
pub async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "service": "wxbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "logged_in": state.engine.is_logged_in(),
        "instructions": "GET /qr for the login code; POST /send to send text; POST /upload to send a file.",
    }))
}

/// GET /qr — login QR code (PNG), or a plain-text notice when already
/// logged in.
pub async fn qr(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.get_login_qr().await {
        Ok(png) if png.is_empty() => (
            [(header::CONTENT_TYPE, "text/plain")],
            "Already logged in. You can now use /send.",
        )
            .into_response(),
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /login/status
pub async fn login_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.engine.login_status_detail())
}

#[derive(Deserialize)]
pub struct SendBody {
    content: String,
}

/// POST /send — direct text send, bypassing the dispatcher.
pub async fn send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBody>,
) -> Response {
    match state.engine.send_text(&body.content).await {
        Ok(_) => Json(json!({ "status": "sent", "content": body.content })).into_response(),
        Err(EngineError::NotLoggedIn) => error_json(
            StatusCode::UNAUTHORIZED,
            "Session not active. Scan the QR code at /qr first.",
        ),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// POST /upload — multipart file upload, forwarded upstream.
pub async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    if !state.engine.is_logged_in() {
        return error_json(StatusCode::UNAUTHORIZED, "Session not active.");
    }

    let field = match multipart.next_field().await {
        Ok(Some(field)) => field,
        Ok(None) => return error_json(StatusCode::BAD_REQUEST, "no file field in request"),
        Err(e) => return error_json(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let file_name = field
        .file_name()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "upload.bin".to_string());
    let data = match field.bytes().await {
        Ok(data) => data,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    // Stage to a temp path so the engine's file-send path (size check, MD5,
    // MIME sniff) sees a real file.
    let safe_name = file_name.replace(['/', '\\'], "_");
    let tmp_path = std::env::temp_dir().join(format!("wxbridge-upload-{}-{safe_name}", uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp_path, &data).await {
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let result = state.engine.send_file(&tmp_path).await;
    if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
        warn!("upload temp cleanup failed: {e}");
    }

    match result {
        Ok(_) => Json(json!({ "status": "sent", "filename": file_name })).into_response(),
        Err(e @ EngineError::FileTooLarge { .. }) => {
            error_json(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(EngineError::NotLoggedIn) => error_json(StatusCode::UNAUTHORIZED, "Session not active."),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize, Default)]
pub struct MessagesQuery {
    limit: Option<usize>,
}

/// GET /messages — the engine's recent-message cache (post-sync).
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MessagesQuery>,
) -> Json<Value> {
    let limit = q.limit.unwrap_or(10).clamp(1, 200);
    let messages = state.engine.get_latest_messages(limit).await;
    Json(json!({ "messages": messages }))
}

/// GET /debug/state — engine state dump.
pub async fn debug_state(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.engine.state_snapshot())
}

/// POST /wechat/session/save
pub async fn session_save(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.save_session() {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /wechat/trace/status
pub async fn trace_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.engine.trace().status())
}

#[derive(Deserialize, Default)]
pub struct TraceRecentQuery {
    limit: Option<usize>,
}

/// GET /wechat/trace/recent
pub async fn trace_recent(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TraceRecentQuery>,
) -> Json<Value> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let rows = state.engine.trace().read_recent(limit).await;
    Json(json!({ "count": rows.len(), "rows": rows }))
}

/// POST /wechat/trace/clear
pub async fn trace_clear(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.trace().clear().await;
    Json(json!({ "status": "cleared" }))
}
