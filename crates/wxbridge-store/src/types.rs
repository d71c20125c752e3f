use serde::{Deserialize, Serialize};

/// Durable projection of an inbound/outbound message.
///
/// `row_id` is the monotonic insert order; it doubles as the `update_id`
/// offset cursor of the Telegram-style updates feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub row_id: i64,
    pub msg_id: String,
    pub kind: String,
    pub text: String,
    pub is_mine: bool,
    pub timestamp: i64,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub reply_to_id: Option<String>,
    pub raw_data: Option<String>,
    pub extra: Option<String>,
}

/// Metadata for a downloaded attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: i64,
    pub msg_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub md5: Option<String>,
    pub created_at: i64,
    pub downloaded: bool,
}

/// Arguments for [`crate::MessageStore::save_message`]. Only `msg_id`,
/// `kind`, and `text` are required in practice.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub msg_id: String,
    pub kind: String,
    pub text: String,
    pub is_mine: bool,
    pub timestamp: Option<i64>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub reply_to_id: Option<String>,
    pub raw_data: Option<serde_json::Value>,
    pub extra: Option<serde_json::Value>,
}

/// Storage counters returned by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub db_path: String,
    pub db_size_bytes: u64,
    pub message_count: i64,
    pub file_count: i64,
    pub max_update_id: i64,
    pub today_message_count: i64,
}
