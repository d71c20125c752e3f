//! Redaction-aware request/response tracing.
//!
//! Every upstream request and its response are captured as one JSON record
//! each, pushed into a bounded in-memory ring, and flushed every two seconds
//! to an append-only JSON-lines file. Sensitive headers are masked and the
//! sensitive query/body parameters are redacted before a record ever enters
//! the ring, so the file never sees a secret.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use wxbridge_core::bounded::BoundedRing;

/// In-memory ring capacity; records beyond this are dropped oldest-first
/// when flushing falls behind.
const RING_CAP: usize = 100;

/// Cadence of the background flush loop.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// URL-style (`name=value`, `name: value`) patterns. Applied before the
/// JSON-style set so a quoted parameter is matched exactly once.
static URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        "pass_ticket",
        "webwx_data_ticket",
        "skey",
        "sid",
        "wxsid",
        "deviceid",
        "uin",
        "aeskey",
        "signature",
    ]
    .iter()
    .map(|name| {
        Regex::new(&format!(r#"(?i)({name}\s*[=:]\s*)([^&\s"',;]+)"#)).expect("redaction pattern")
    })
    .collect()
});

/// JSON-style (`"Name":"value"` or `"Name":1234`) patterns, covering the
/// same nine sensitive names as the URL-style set. `Uin` is numeric in
/// `BaseRequest`, so the value side accepts unquoted scalars too.
static JSON_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        "pass_ticket",
        "webwx_data_ticket",
        "Skey",
        "Sid",
        "Wxsid",
        "DeviceID",
        "Uin",
        "AESKey",
        "Signature",
    ]
    .iter()
    .map(|name| {
        Regex::new(&format!(r#"(?i)("{name}"\s*:\s*"?)[^",}}\s]*("?)"#))
            .expect("redaction pattern")
    })
    .collect()
});

const MASKED_HEADERS: &[&str] = &["cookie", "set-cookie", "authorization"];

#[derive(Debug, Clone)]
pub struct TraceOptions {
    pub enabled: bool,
    pub redact: bool,
    pub max_body: usize,
    pub dir: PathBuf,
}

/// Buffered, redacting trace recorder. Cheap to share as `Arc`.
pub struct TraceRecorder {
    opts: TraceOptions,
    log_file: PathBuf,
    buffer: Mutex<BoundedRing<String>>,
    seq: AtomicU64,
}

impl TraceRecorder {
    pub fn new(opts: TraceOptions) -> Self {
        let log_file = opts.dir.join("wechat_http_trace.jsonl");
        Self {
            opts,
            log_file,
            buffer: Mutex::new(BoundedRing::new(RING_CAP)),
            seq: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.opts.enabled
    }

    /// Fresh trace id, shared by a request record and its response record.
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn record_request(
        &self,
        id: &str,
        method: &str,
        url: &str,
        headers: &reqwest::header::HeaderMap,
        body_preview: &str,
    ) {
        if !self.opts.enabled {
            return;
        }
        self.push(json!({
            "event": "request",
            "id": id,
            "ts": chrono::Utc::now().timestamp_millis(),
            "method": method,
            "url": self.sanitize_text(url),
            "headers": self.sanitize_headers(headers),
            "body_preview": body_preview,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_response(
        &self,
        id: &str,
        method: &str,
        url: &str,
        status: u16,
        duration_ms: u64,
        headers: &reqwest::header::HeaderMap,
        body_preview: &str,
    ) {
        if !self.opts.enabled {
            return;
        }
        self.push(json!({
            "event": "response",
            "id": id,
            "ts": chrono::Utc::now().timestamp_millis(),
            "method": method,
            "url": self.sanitize_text(url),
            "status_code": status,
            "duration_ms": duration_ms,
            "headers": self.sanitize_headers(headers),
            "body_preview": body_preview,
        }));
    }

    /// Redact sensitive parameters. URL-style patterns run first so a
    /// `"pass_ticket":"…"` inside a JSON body is matched exactly once by
    /// the JSON pass.
    pub fn sanitize_text(&self, text: &str) -> String {
        if !self.opts.redact {
            return text.to_string();
        }
        let mut out = text.to_string();
        for re in URL_PATTERNS.iter() {
            out = re.replace_all(&out, "${1}***").into_owned();
        }
        for re in JSON_PATTERNS.iter() {
            out = re.replace_all(&out, "${1}***${2}").into_owned();
        }
        out
    }

    fn sanitize_headers(&self, headers: &reqwest::header::HeaderMap) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in headers {
            let key = name.as_str().to_string();
            if MASKED_HEADERS.contains(&key.as_str()) {
                map.insert(key, Value::String("***".to_string()));
                continue;
            }
            let text = value.to_str().unwrap_or("<<non-ascii>>");
            map.insert(key, Value::String(self.sanitize_text(text)));
        }
        Value::Object(map)
    }

    /// Clip, decode, and sanitize a body. Non-text payloads are replaced
    /// with a size marker.
    pub fn preview_bytes(&self, payload: &[u8], content_type: &str) -> String {
        if payload.is_empty() {
            return String::new();
        }
        if !is_textual_content_type(content_type) {
            let kind = if content_type.is_empty() { "unknown" } else { content_type };
            return format!("<<non-text {} {} bytes>>", kind, payload.len());
        }
        let clipped = &payload[..payload.len().min(self.opts.max_body)];
        let mut text = String::from_utf8_lossy(clipped).into_owned();
        if payload.len() > clipped.len() {
            text.push_str(&format!(" ...<truncated {} bytes>", payload.len() - clipped.len()));
        }
        self.sanitize_text(&text)
    }

    fn push(&self, row: Value) {
        let line = row.to_string();
        self.buffer.lock().unwrap().push(line);
    }

    /// Drain the ring and append to the JSONL file.
    pub async fn flush(&self) {
        let lines: Vec<String> = {
            let mut buf = self.buffer.lock().unwrap();
            let drained = buf.last_n(RING_CAP);
            buf.clear();
            drained
        };
        if lines.is_empty() {
            return;
        }

        if let Some(parent) = self.log_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!("trace dir create failed: {e}");
                return;
            }
        }
        let content = lines.join("\n") + "\n";
        let open = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await;
        match open {
            Ok(mut file) => {
                if let Err(e) = file.write_all(content.as_bytes()).await {
                    error!("trace write failed: {e}");
                }
            }
            Err(e) => error!("trace open failed: {e}"),
        }
    }

    /// Background loop: flush every [`FLUSH_INTERVAL`] until shutdown.
    pub async fn run_flush_loop(self: std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.opts.enabled {
            return;
        }
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => self.flush().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush().await;
                        info!("trace flush loop stopped");
                        break;
                    }
                }
            }
        }
    }

    pub fn status(&self) -> Value {
        let size = std::fs::metadata(&self.log_file).map(|m| m.len()).unwrap_or(0);
        json!({
            "enabled": self.opts.enabled,
            "redact": self.opts.redact,
            "max_body": self.opts.max_body,
            "file": self.log_file.display().to_string(),
            "exists": self.log_file.exists(),
            "size_bytes": size,
        })
    }

    /// The newest `limit` records from the log file (oldest first).
    pub async fn read_recent(&self, limit: usize) -> Vec<Value> {
        if !self.opts.enabled {
            return Vec::new();
        }
        let raw = match tokio::fs::read_to_string(&self.log_file).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let limit = limit.clamp(1, 1000);
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(limit);
        lines[skip..]
            .iter()
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|_| json!({ "raw": line }))
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.buffer.lock().unwrap().clear();
        if let Err(e) = tokio::fs::remove_file(&self.log_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("trace clear failed: {e}");
            }
        }
    }
}

pub(crate) fn is_textual_content_type(content_type: &str) -> bool {
    let value = content_type.to_ascii_lowercase();
    ["json", "text", "xml", "javascript", "html", "x-www-form-urlencoded"]
        .iter()
        .any(|word| value.contains(word))
}
