//! Message-store and downloads queries.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::app::AppState;

/// GET /store/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    match state.store.get_stats() {
        Ok(stats) => Json(json!(stats)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct StoreMessagesQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /store/messages — newest rows, or an offset-based feed when
/// `offset` is given.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StoreMessagesQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(50).clamp(1, 1000);
    let result = match q.offset {
        Some(offset) if offset > 0 => state.store.get_updates(offset, limit, None, None),
        _ => state.store.get_latest(limit),
    };
    match result {
        Ok(rows) => Json(json!({ "count": rows.len(), "messages": rows })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct DownloadsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /downloads — downloaded-file rows plus the static mount base.
pub async fn downloads(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DownloadsQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let offset = q.offset.unwrap_or(0).max(0);
    match state.store.get_files(limit, offset) {
        Ok(files) => Json(json!({
            "count": files.len(),
            "files": files,
            "base_url": "/static/",
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct CleanupQuery {
    days: Option<u32>,
    delete_files: Option<bool>,
}

/// POST /files/cleanup — manual retention sweep.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CleanupQuery>,
) -> Response {
    let days = q.days.unwrap_or(30);
    let delete_files = q.delete_files.unwrap_or(true);
    if days == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "days must be positive" })),
        )
            .into_response();
    }
    match state.store.cleanup_old_files(days, delete_files) {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response(),
    }
}
