use rusqlite::Connection;

use crate::error::Result;

/// Initialise the message/file/kv schema and its indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA cache_size=10000;
        PRAGMA temp_store=MEMORY;

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            msg_id      TEXT NOT NULL UNIQUE,
            kind        TEXT NOT NULL,
            text        TEXT,
            is_mine     INTEGER NOT NULL DEFAULT 0,
            timestamp   INTEGER NOT NULL,
            file_name   TEXT,
            file_path   TEXT,
            file_size   INTEGER,
            reply_to_id TEXT,
            raw_data    TEXT,
            extra       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_msg_id    ON messages(msg_id);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_kind      ON messages(kind);

        CREATE TABLE IF NOT EXISTS files (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            msg_id     TEXT NOT NULL,
            file_name  TEXT NOT NULL,
            file_path  TEXT NOT NULL,
            file_size  INTEGER,
            mime_type  TEXT,
            md5        TEXT,
            created_at INTEGER NOT NULL,
            downloaded INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_files_msg_id     ON files(msg_id);
        CREATE INDEX IF NOT EXISTS idx_files_created_at ON files(created_at);

        CREATE TABLE IF NOT EXISTS kv_store (
            key        TEXT PRIMARY KEY,
            value      TEXT,
            updated_at INTEGER
        );",
    )?;
    Ok(())
}
