//! Telegram-Bot-API-compatible endpoints.
//!
//! Responses always carry the TG envelope: `{ok, result}` on success,
//! `{ok:false, error_code, description}` on failure (HTTP status stays
//! 200, as TG clients key off the body).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use wxbridge_engine::EngineError;
use wxbridge_store::types::NewMessage;
use wxbridge_store::StoredMessage;

use crate::app::AppState;

fn tg_ok(result: Value) -> Json<Value> {
    Json(json!({ "ok": true, "result": result }))
}

fn tg_err(code: u16, description: &str) -> Json<Value> {
    Json(json!({ "ok": false, "error_code": code, "description": description }))
}

fn tg_unauthorized() -> Json<Value> {
    tg_err(401, "Unauthorized")
}

fn engine_error_response(e: &EngineError) -> Json<Value> {
    match e {
        EngineError::NotLoggedIn => tg_unauthorized(),
        EngineError::FileTooLarge { .. } | EngineError::FileNotFound(_) => {
            tg_err(400, &format!("Bad Request: {e}"))
        }
        other => tg_err(500, &format!("Internal Server Error: {other}")),
    }
}

/// TG-shaped message object for the updates feed.
fn message_json(msg: &StoredMessage) -> Value {
    let mut message = json!({
        "message_id": msg.msg_id,
        "date": msg.timestamp,
        "text": msg.text,
        "type": msg.kind,
        "is_from_bot": msg.is_mine,
    });
    if let Some(reply_to) = &msg.reply_to_id {
        message["reply_to_message_id"] = json!(reply_to);
    }
    if msg.kind != "text" {
        message["document"] = json!({
            "file_id": msg.msg_id,
            "file_name": msg.file_name,
            "file_size": msg.file_size,
        });
    }
    message
}

/// GET /bot/getMe
pub async fn get_me(State(state): State<Arc<AppState>>) -> Json<Value> {
    if !state.engine.is_logged_in() {
        return tg_unauthorized();
    }
    let uin: i64 = state.engine.uin().parse().unwrap_or(0);
    let user_name = state.engine.user_name();
    tg_ok(json!({
        "id": uin,
        "is_bot": true,
        "first_name": if user_name.is_empty() { "WeChat FileHelper".to_string() } else { user_name },
        "username": "filehelper",
    }))
}

#[derive(Deserialize, Default)]
pub struct GetUpdatesQuery {
    offset: Option<i64>,
    limit: Option<i64>,
    #[allow(dead_code)]
    timeout: Option<i64>,
    #[serde(default)]
    allowed_updates: Option<String>,
}

/// GET /bot/getUpdates — the store-backed updates feed.
pub async fn get_updates(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GetUpdatesQuery>,
) -> Json<Value> {
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(100).clamp(1, 100);
    // allowed_updates is accepted for compatibility; only messages exist.
    let _ = q.allowed_updates;

    match state.store.get_updates(offset, limit, None, None) {
        Ok(rows) => {
            let updates: Vec<Value> = rows
                .iter()
                .map(|msg| json!({ "update_id": msg.row_id, "message": message_json(msg) }))
                .collect();
            tg_ok(json!(updates))
        }
        Err(e) => tg_err(500, &format!("Internal Server Error: {e}")),
    }
}

/// Parse a request body leniently: TG clients always send JSON, but the
/// error shape must stay TG-flavored even for an empty body.
fn parse_body(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

/// POST /bot/sendMessage
pub async fn send_message(State(state): State<Arc<AppState>>, raw: String) -> Json<Value> {
    let body = parse_body(&raw);
    let Some(text) = body["text"].as_str().filter(|t| !t.is_empty()) else {
        return tg_err(400, "Bad Request: text is required");
    };
    if !state.engine.is_logged_in() {
        return tg_unauthorized();
    }

    match state.engine.send_text(text).await {
        Ok(msg_id) => {
            let msg_id = if msg_id.is_empty() {
                format!("out-{}", chrono::Utc::now().timestamp_millis())
            } else {
                msg_id
            };
            let date = chrono::Utc::now().timestamp();
            if let Err(e) = state.store.save_message(NewMessage {
                msg_id: msg_id.clone(),
                kind: "text".to_string(),
                text: text.to_string(),
                is_mine: true,
                reply_to_id: body["reply_to_message_id"].as_str().map(|s| s.to_string()),
                ..NewMessage::default()
            }) {
                warn!("sent message persist failed: {e}");
            }
            tg_ok(json!({ "message_id": msg_id, "date": date, "text": text }))
        }
        Err(e) => engine_error_response(&e),
    }
}

async fn send_attachment(
    state: &Arc<AppState>,
    body: &Value,
    path_keys: &[&str],
    kind: &str,
) -> Json<Value> {
    let path = path_keys
        .iter()
        .find_map(|k| body[k].as_str())
        .filter(|p| !p.is_empty());
    let Some(path) = path else {
        let wanted = path_keys.join(" or ");
        return tg_err(400, &format!("Bad Request: {wanted} is required"));
    };
    if !state.engine.is_logged_in() {
        return tg_unauthorized();
    }

    let path_buf = std::path::PathBuf::from(path);
    match state.engine.send_file(&path_buf).await {
        Ok(msg_id) => {
            let file_name = path_buf
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file")
                .to_string();
            let file_size = std::fs::metadata(&path_buf).map(|m| m.len()).unwrap_or(0);
            let msg_id = if msg_id.is_empty() {
                format!("out-{}", chrono::Utc::now().timestamp_millis())
            } else {
                msg_id
            };
            if let Err(e) = state.store.save_message(NewMessage {
                msg_id: msg_id.clone(),
                kind: kind.to_string(),
                text: format!("[File: {file_name}]"),
                is_mine: true,
                file_name: Some(file_name.clone()),
                file_path: Some(path.to_string()),
                file_size: Some(file_size as i64),
                ..NewMessage::default()
            }) {
                warn!("sent attachment persist failed: {e}");
            }
            tg_ok(json!({
                "message_id": msg_id,
                "date": chrono::Utc::now().timestamp(),
                "document": { "file_name": file_name, "file_size": file_size },
                "caption": body["caption"].as_str(),
            }))
        }
        Err(e) => engine_error_response(&e),
    }
}

/// POST /bot/sendDocument
pub async fn send_document(State(state): State<Arc<AppState>>, raw: String) -> Json<Value> {
    let body = parse_body(&raw);
    send_attachment(&state, &body, &["document", "file_path"], "file").await
}

/// POST /bot/sendPhoto
pub async fn send_photo(State(state): State<Arc<AppState>>, raw: String) -> Json<Value> {
    let body = parse_body(&raw);
    send_attachment(&state, &body, &["photo", "file_path"], "image").await
}

/// GET /bot/getChat — stub descriptor for the single private chat.
pub async fn get_chat(State(state): State<Arc<AppState>>) -> Json<Value> {
    if !state.engine.is_logged_in() {
        return tg_unauthorized();
    }
    tg_ok(json!({
        "id": "filehelper",
        "type": "private",
        "first_name": "File Transfer Assistant",
        "username": "filehelper",
    }))
}

/// POST /bot/setWebhook
pub async fn set_webhook(State(state): State<Arc<AppState>>, raw: String) -> Json<Value> {
    let body = parse_body(&raw);
    let Some(url) = body["url"].as_str() else {
        return tg_err(400, "Bad Request: url is required");
    };
    state.dispatcher.set_webhook(url);
    tg_ok(json!(true))
}

/// POST /bot/deleteWebhook
pub async fn delete_webhook(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.dispatcher.delete_webhook();
    tg_ok(json!(true))
}

/// GET /bot/getWebhookInfo
pub async fn get_webhook_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    tg_ok(state.dispatcher.webhook_info())
}

#[derive(Deserialize, Default)]
pub struct GetFileQuery {
    file_id: Option<String>,
}

/// GET /bot/getFile — resolve a downloaded attachment by message id.
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GetFileQuery>,
) -> Json<Value> {
    let Some(file_id) = q.file_id.filter(|id| !id.is_empty()) else {
        return tg_err(400, "Bad Request: file_id is required");
    };
    match state.store.get_file_by_msg_id(&file_id) {
        Ok(Some(file)) => tg_ok(json!({
            "file_id": file.msg_id,
            "file_unique_id": file.id.to_string(),
            "file_size": file.file_size,
            "file_path": file.file_path,
        })),
        Ok(None) => tg_err(400, "Bad Request: file not found"),
        Err(e) => tg_err(500, &format!("Internal Server Error: {e}")),
    }
}
