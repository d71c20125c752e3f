use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{NewMessage, StoreStats, StoredFile, StoredMessage};

/// Hard cap on rows returned by the updates feed regardless of `limit`.
const MAX_FEED_ROWS: i64 = 1000;

/// How long `get_stats` may serve a cached snapshot.
const STATS_TTL: Duration = Duration::from_secs(5);

/// Durable message and file store.
///
/// Wraps a single auto-commit SQLite connection in a `Mutex`; WAL mode keeps
/// readers and the writer from blocking each other at the file level.
pub struct MessageStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    stats_cache: Mutex<Option<(StoreStats, Instant)>>,
}

impl MessageStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: Some(path.as_ref().to_path_buf()),
            stats_cache: Mutex::new(None),
        })
    }

    /// Wrap an already-open connection (used by tests).
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
            stats_cache: Mutex::new(None),
        })
    }

    /// Upsert a message; returns the new monotonic row id.
    ///
    /// A colliding `msg_id` replaces the old row and receives a fresh,
    /// larger row id; insertion order stays strictly increasing.
    #[instrument(skip(self, msg), fields(msg_id = %msg.msg_id))]
    pub fn save_message(&self, msg: NewMessage) -> Result<i64> {
        let ts = msg.timestamp.unwrap_or_else(|| Utc::now().timestamp());
        let raw_json = msg.raw_data.map(|v| v.to_string());
        let extra_json = msg.extra.map(|v| v.to_string());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO messages
             (msg_id, kind, text, is_mine, timestamp,
              file_name, file_path, file_size, reply_to_id, raw_data, extra)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                msg.msg_id,
                msg.kind,
                msg.text,
                msg.is_mine as i64,
                ts,
                msg.file_name,
                msg.file_path,
                msg.file_size,
                msg.reply_to_id,
                raw_json,
                extra_json,
            ],
        )?;
        self.invalidate_stats();
        Ok(conn.last_insert_rowid())
    }

    pub fn get_message(&self, msg_id: &str) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, msg_id, kind, text, is_mine, timestamp,
                    file_name, file_path, file_size, reply_to_id, raw_data, extra
             FROM messages WHERE msg_id = ?1",
            [msg_id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_message_by_row_id(&self, row_id: i64) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, msg_id, kind, text, is_mine, timestamp,
                    file_name, file_path, file_size, reply_to_id, raw_data, extra
             FROM messages WHERE id = ?1",
            [row_id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Telegram-style updates feed: rows with `row_id > offset`, ascending,
    /// at most `min(limit, 1000)`.
    #[instrument(skip(self))]
    pub fn get_updates(
        &self,
        offset: i64,
        limit: i64,
        kind: Option<&str>,
        since: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let mut sql = String::from(
            "SELECT id, msg_id, kind, text, is_mine, timestamp,
                    file_name, file_path, file_size, reply_to_id, raw_data, extra
             FROM messages WHERE id > ?1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(offset)];
        if let Some(k) = kind {
            sql.push_str(" AND kind = ?2");
            params.push(Box::new(k.to_string()));
        }
        if let Some(ts) = since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(ts));
        }
        sql.push_str(&format!(" ORDER BY id ASC LIMIT ?{}", params.len() + 1));
        params.push(Box::new(limit.clamp(0, MAX_FEED_ROWS)));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The newest `limit` rows, reversed to ascending row-id order.
    pub fn get_latest(&self, limit: i64) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, kind, text, is_mine, timestamp,
                    file_name, file_path, file_size, reply_to_id, raw_data, extra
             FROM messages ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows: Vec<StoredMessage> = stmt
            .query_map([limit.clamp(0, MAX_FEED_ROWS)], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    pub fn max_update_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM messages", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(msg_id, file_name))]
    pub fn save_file(
        &self,
        msg_id: &str,
        file_name: &str,
        file_path: &str,
        file_size: i64,
        mime_type: Option<&str>,
        md5: Option<&str>,
        downloaded: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files
             (msg_id, file_name, file_path, file_size, mime_type, md5, created_at, downloaded)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            rusqlite::params![
                msg_id,
                file_name,
                file_path,
                file_size,
                mime_type,
                md5,
                Utc::now().timestamp(),
                downloaded as i64,
            ],
        )?;
        self.invalidate_stats();
        Ok(conn.last_insert_rowid())
    }

    pub fn get_file_by_msg_id(&self, msg_id: &str) -> Result<Option<StoredFile>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, msg_id, file_name, file_path, file_size, mime_type, md5,
                    created_at, downloaded
             FROM files WHERE msg_id = ?1 ORDER BY id DESC LIMIT 1",
            [msg_id],
            row_to_file,
        ) {
            Ok(f) => Ok(Some(f)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_files(&self, limit: i64, offset: i64) -> Result<Vec<StoredFile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, file_name, file_path, file_size, mime_type, md5,
                    created_at, downloaded
             FROM files ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map([limit, offset], row_to_file)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_kv(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1,?2,?3)",
            rusqlite::params![key, value.to_string(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_kv(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        }) {
            Ok(raw) => Ok(Some(
                serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
            )),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete message rows older than `days`. Returns the removed count.
    pub fn cleanup_old_messages(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM messages WHERE timestamp < ?1", [cutoff])?;
        self.invalidate_stats();
        Ok(n)
    }

    /// Delete file rows older than `days`; with `delete_files` the on-disk
    /// copies go too.
    pub fn cleanup_old_files(&self, days: u32, delete_files: bool) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - i64::from(days) * 86_400;
        let conn = self.conn.lock().unwrap();

        if delete_files {
            let mut stmt = conn.prepare("SELECT file_path FROM files WHERE created_at < ?1")?;
            let paths: Vec<String> = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            for path in paths {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(%path, "failed to delete expired file: {e}");
                    }
                }
            }
        }

        let n = conn.execute("DELETE FROM files WHERE created_at < ?1", [cutoff])?;
        self.invalidate_stats();
        Ok(n)
    }

    /// Storage counters, cached for 5 s.
    pub fn get_stats(&self) -> Result<StoreStats> {
        {
            let cache = self.stats_cache.lock().unwrap();
            if let Some((stats, at)) = cache.as_ref() {
                if at.elapsed() < STATS_TTL {
                    debug!("stats cache hit");
                    return Ok(stats.clone());
                }
            }
        }

        let (message_count, file_count, max_update_id, today_message_count) = {
            let conn = self.conn.lock().unwrap();
            let message_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
            let file_count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
            let max_update_id: Option<i64> =
                conn.query_row("SELECT MAX(id) FROM messages", [], |r| r.get(0))?;
            let midnight = Local::now().date_naive().and_hms_opt(0, 0, 0).unwrap();
            let today_start = Local
                .from_local_datetime(&midnight)
                .single()
                .map(|dt| dt.timestamp())
                .unwrap_or(0);
            let today_message_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE timestamp >= ?1",
                [today_start],
                |r| r.get(0),
            )?;
            (
                message_count,
                file_count,
                max_update_id.unwrap_or(0),
                today_message_count,
            )
        };

        let db_size_bytes = self
            .db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        let stats = StoreStats {
            db_path: self
                .db_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string()),
            db_size_bytes,
            message_count,
            file_count,
            max_update_id,
            today_message_count,
        };
        *self.stats_cache.lock().unwrap() = Some((stats.clone(), Instant::now()));
        Ok(stats)
    }

    fn invalidate_stats(&self) {
        *self.stats_cache.lock().unwrap() = None;
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        row_id: row.get(0)?,
        msg_id: row.get(1)?,
        kind: row.get(2)?,
        text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        is_mine: row.get::<_, i64>(4)? != 0,
        timestamp: row.get(5)?,
        file_name: row.get(6)?,
        file_path: row.get(7)?,
        file_size: row.get(8)?,
        reply_to_id: row.get(9)?,
        raw_data: row.get(10)?,
        extra: row.get(11)?,
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFile> {
    Ok(StoredFile {
        id: row.get(0)?,
        msg_id: row.get(1)?,
        file_name: row.get(2)?,
        file_path: row.get(3)?,
        file_size: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        mime_type: row.get(5)?,
        md5: row.get(6)?,
        created_at: row.get(7)?,
        downloaded: row.get::<_, i64>(8)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MessageStore {
        MessageStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn msg(id: &str, text: &str) -> NewMessage {
        NewMessage {
            msg_id: id.to_string(),
            kind: "text".to_string(),
            text: text.to_string(),
            ..NewMessage::default()
        }
    }

    #[test]
    fn row_ids_increase_per_insert() {
        let s = store();
        let a = s.save_message(msg("1", "a")).unwrap();
        let b = s.save_message(msg("2", "b")).unwrap();
        let c = s.save_message(msg("3", "c")).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn upsert_replaces_on_msg_id_collision() {
        let s = store();
        s.save_message(msg("dup", "first")).unwrap();
        s.save_message(msg("dup", "second")).unwrap();
        let got = s.get_message("dup").unwrap().unwrap();
        assert_eq!(got.text, "second");
        // Only one row survives the collision.
        assert_eq!(s.get_latest(10).unwrap().len(), 1);
    }

    #[test]
    fn get_updates_respects_offset_and_order() {
        let s = store();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(s.save_message(msg(&i.to_string(), "x")).unwrap());
        }
        let rows = s.get_updates(ids[1], 100, None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.row_id > ids[1]));
        assert!(rows.windows(2).all(|w| w[0].row_id < w[1].row_id));
    }

    #[test]
    fn get_updates_caps_limit() {
        let s = store();
        for i in 0..5 {
            s.save_message(msg(&i.to_string(), "x")).unwrap();
        }
        assert_eq!(s.get_updates(0, 2, None, None).unwrap().len(), 2);
        // Oversized limits are clamped rather than rejected.
        assert_eq!(s.get_updates(0, 9999, None, None).unwrap().len(), 5);
    }

    #[test]
    fn get_updates_filters_by_kind() {
        let s = store();
        s.save_message(msg("t1", "text")).unwrap();
        s.save_message(NewMessage {
            msg_id: "i1".to_string(),
            kind: "image".to_string(),
            text: "[Image]".to_string(),
            ..NewMessage::default()
        })
        .unwrap();
        let rows = s.get_updates(0, 100, Some("image"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].msg_id, "i1");
    }

    #[test]
    fn latest_is_ascending() {
        let s = store();
        for i in 0..4 {
            s.save_message(msg(&i.to_string(), &format!("m{i}"))).unwrap();
        }
        let rows = s.get_latest(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text, "m2");
        assert_eq!(rows[1].text, "m3");
    }

    #[test]
    fn file_rows_round_trip() {
        let s = store();
        s.save_message(msg("77", "[Image]")).unwrap();
        s.save_file("77", "download_77.jpg", "/tmp/download_77.jpg", 1234, Some("image/jpeg"), None, true)
            .unwrap();
        let f = s.get_file_by_msg_id("77").unwrap().unwrap();
        assert_eq!(f.file_name, "download_77.jpg");
        assert_eq!(f.file_size, 1234);
        assert!(f.downloaded);
        assert!(s.get_file_by_msg_id("78").unwrap().is_none());
    }

    #[test]
    fn kv_round_trips_json() {
        let s = store();
        s.set_kv("cursor", &serde_json::json!({"Count": 2})).unwrap();
        let v = s.get_kv("cursor").unwrap().unwrap();
        assert_eq!(v["Count"], 2);
        assert!(s.get_kv("missing").unwrap().is_none());
    }

    #[test]
    fn cleanup_removes_only_old_rows() {
        let s = store();
        s.save_message(NewMessage {
            timestamp: Some(Utc::now().timestamp() - 40 * 86_400),
            ..msg("old", "old")
        })
        .unwrap();
        s.save_message(msg("new", "new")).unwrap();
        let removed = s.cleanup_old_messages(30).unwrap();
        assert_eq!(removed, 1);
        assert!(s.get_message("old").unwrap().is_none());
        assert!(s.get_message("new").unwrap().is_some());
    }

    #[test]
    fn stats_counts_and_caches() {
        let s = store();
        s.save_message(msg("1", "a")).unwrap();
        let first = s.get_stats().unwrap();
        assert_eq!(first.message_count, 1);
        // Within the TTL the cached snapshot is served even after an
        // invalidating write is skipped (direct cache probe).
        let again = s.get_stats().unwrap();
        assert_eq!(again.message_count, 1);
        s.save_message(msg("2", "b")).unwrap();
        let after = s.get_stats().unwrap();
        assert_eq!(after.message_count, 2);
    }
}
