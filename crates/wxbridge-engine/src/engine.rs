use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, SET_COOKIE};
use serde_json::{json, Value};
use tracing::{debug, warn};

use wxbridge_core::bounded::{BoundedMap, BoundedRing, BoundedSet};
use wxbridge_core::config::Settings;
use wxbridge_core::types::InboundMessage;

use crate::error::Result;
use crate::login::LoginProgress;
use crate::session::{CookieRecord, Session};
use crate::trace::{is_textual_content_type, TraceOptions, TraceRecorder};

/// Bounded-cache capacities. Eviction is FIFO (see `wxbridge_core::bounded`).
pub(crate) const MSG_CACHE_CAP: usize = 200;
pub(crate) const RAW_BY_ID_CAP: usize = 500;
pub(crate) const SEEN_IDS_CAP: usize = 5000;
pub(crate) const SENT_IDS_CAP: usize = 200;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub entry_host: String,
    pub state_path: PathBuf,
    pub max_upload_size: u64,
    pub login_callback_url: String,
    pub trace: TraceOptions,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            entry_host: settings.wechat_entry_host.clone(),
            state_path: PathBuf::from("state.json"),
            max_upload_size: settings.max_upload_size,
            login_callback_url: settings.login_callback_url.clone(),
            trace: TraceOptions {
                enabled: settings.wechat_trace_enabled,
                redact: settings.wechat_trace_redact,
                max_body: settings.wechat_trace_max_body,
                dir: settings.wechat_trace_dir.clone(),
            },
        }
    }
}

/// The protocol engine. One instance per process; all methods take `&self`
/// and serialize state behind internal locks. No lock is ever held across
/// an await point.
pub struct Engine {
    pub(crate) opts: EngineOptions,
    pub(crate) http: reqwest::Client,
    jar: Arc<Jar>,
    pub(crate) session: Mutex<Session>,
    pub(crate) progress: Mutex<LoginProgress>,
    logged_in: AtomicBool,
    pub(crate) login_callback_sent: AtomicBool,
    pub(crate) msg_cache: Mutex<BoundedRing<InboundMessage>>,
    pub(crate) raw_by_id: Mutex<BoundedMap<Value>>,
    pub(crate) seen_ids: Mutex<BoundedSet>,
    pub(crate) sent_ids: Mutex<BoundedSet>,
    /// Serializes send operations (text and file) against the upstream.
    pub(crate) send_lock: tokio::sync::Mutex<()>,
    trace: Arc<TraceRecorder>,
}

impl Engine {
    pub fn new(opts: EngineOptions) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let mut default_headers = HeaderMap::new();
        default_headers.insert("accept", HeaderValue::from_static("*/*"));
        default_headers.insert(
            "accept-language",
            HeaderValue::from_static("zh,zh-CN;q=0.9,en;q=0.8"),
        );
        default_headers.insert(
            "referer",
            HeaderValue::from_static("https://filehelper.weixin.qq.com/"),
        );

        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(40))
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .build()?;

        let trace = Arc::new(TraceRecorder::new(opts.trace.clone()));
        let session = Session::new(&opts.entry_host);

        Ok(Self {
            opts,
            http,
            jar,
            session: Mutex::new(session),
            progress: Mutex::new(LoginProgress::new()),
            logged_in: AtomicBool::new(false),
            login_callback_sent: AtomicBool::new(false),
            msg_cache: Mutex::new(BoundedRing::new(MSG_CACHE_CAP)),
            raw_by_id: Mutex::new(BoundedMap::new(RAW_BY_ID_CAP)),
            seen_ids: Mutex::new(BoundedSet::new(SEEN_IDS_CAP)),
            sent_ids: Mutex::new(BoundedSet::new(SENT_IDS_CAP)),
            send_lock: tokio::sync::Mutex::new(()),
            trace,
        })
    }

    /// Restore persisted state (if any) and probe the cached credentials.
    pub async fn bootstrap(&self) -> bool {
        if self.opts.state_path.exists() {
            if let Err(e) = self.load_session_from_disk() {
                warn!("session restore failed: {e}");
            }
        }
        self.check_login_status(false).await
    }

    /// Flush the trace ring and persist the session; called on shutdown.
    pub async fn shutdown(&self) {
        self.trace.flush().await;
        if let Err(e) = self.save_session() {
            warn!("session save on shutdown failed: {e}");
        }
    }

    // --- session persistence ------------------------------------------------

    pub fn save_session(&self) -> Result<()> {
        let snapshot = self.session.lock().unwrap().clone();
        snapshot.save(&self.opts.state_path)?;
        debug!(path = %self.opts.state_path.display(), "session saved");
        Ok(())
    }

    /// Replace in-memory state with the on-disk document and replay its
    /// cookies into the jar.
    pub fn load_session_from_disk(&self) -> Result<()> {
        let loaded = Session::load(&self.opts.state_path)?;
        self.replay_cookies(&loaded);
        *self.session.lock().unwrap() = loaded;
        Ok(())
    }

    fn replay_cookies(&self, session: &Session) {
        let hosts = [
            session.entry_host.clone(),
            session.login_host.clone(),
            session.file_host.clone(),
        ];
        for cookie in &session.cookies {
            let cookie_str = cookie.to_cookie_str();
            for host in &hosts {
                if let Ok(url) = format!("https://{host}/").parse::<reqwest::Url>() {
                    self.jar.add_cookie_str(&cookie_str, &url);
                }
            }
        }
    }

    // --- small accessors ----------------------------------------------------

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Relaxed)
    }

    pub(crate) fn set_logged_in(&self, value: bool) {
        self.logged_in.store(value, Ordering::Relaxed);
    }

    /// Called by supervision when synccheck reports `loginout`.
    pub fn mark_logged_out(&self) {
        self.set_logged_in(false);
        self.progress.lock().unwrap().set_logged_out();
    }

    pub fn has_auth(&self) -> bool {
        self.session.lock().unwrap().has_auth()
    }

    pub fn uin(&self) -> String {
        self.session.lock().unwrap().uin.clone()
    }

    pub fn user_name(&self) -> String {
        self.session.lock().unwrap().user_name.clone()
    }

    pub fn entry_host(&self) -> String {
        self.session.lock().unwrap().entry_host.clone()
    }

    pub fn trace(&self) -> Arc<TraceRecorder> {
        self.trace.clone()
    }

    /// True if the upstream id was produced by one of our own sends.
    pub fn is_self_sent(&self, msg_id: &str) -> bool {
        self.sent_ids.lock().unwrap().contains(msg_id)
    }

    pub(crate) fn get_cookie(&self, name: &str) -> Option<String> {
        self.session
            .lock()
            .unwrap()
            .cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    /// Login status JSON served by `GET /login/status`.
    pub fn login_status_detail(&self) -> Value {
        let session = self.session.lock().unwrap();
        let progress = self.progress.lock().unwrap();
        let uuid_age = if session.uuid_ts > 0 {
            Some(chrono::Utc::now().timestamp() - session.uuid_ts)
        } else {
            None
        };
        json!({
            "logged_in": self.is_logged_in(),
            "code": progress.code,
            "status": progress.message,
            "has_uuid": !session.uuid.is_empty(),
            "uuid": session.uuid,
            "uuid_age_seconds": uuid_age,
            "entry_host": session.entry_host,
            "login_host": session.login_host,
            "trace_enabled": self.trace.enabled(),
        })
    }

    /// Engine state dump served by `GET /debug/state`.
    pub fn state_snapshot(&self) -> Value {
        let session = self.session.lock().unwrap();
        json!({
            "mode": "direct_protocol",
            "entry_host": session.entry_host,
            "login_host": session.login_host,
            "file_host": session.file_host,
            "is_logged_in": self.is_logged_in(),
            "uin": session.uin,
            "user_name": session.user_name,
            "has_uuid": !session.uuid.is_empty(),
        })
    }

    // --- traced transport ---------------------------------------------------

    /// Execute a prepared request, recording a redacted request/response
    /// record pair. `body_marker` overrides the request body preview (used
    /// for multipart uploads).
    pub(crate) async fn execute_traced(
        &self,
        req: reqwest::Request,
        body_marker: Option<&str>,
    ) -> Result<TracedResponse> {
        let method = req.method().as_str().to_string();
        let url = req.url().to_string();
        let trace_id = self.trace.next_id();

        if self.trace.enabled() {
            let content_type = req
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let preview = match body_marker {
                Some(marker) => marker.to_string(),
                None => match req.body() {
                    None => String::new(),
                    Some(body) => body
                        .as_bytes()
                        .map(|b| self.trace.preview_bytes(b, &content_type))
                        .unwrap_or_else(|| "<<stream omitted>>".to_string()),
                },
            };
            self.trace
                .record_request(&trace_id, &method, &url, req.headers(), &preview);
        }

        let started = Instant::now();
        let resp = self.http.execute(req).await?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        self.capture_cookies(&headers);

        let bytes = resp.bytes().await?.to_vec();

        if self.trace.enabled() {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let preview = if is_textual_content_type(&content_type) {
                self.trace.preview_bytes(&bytes, &content_type)
            } else {
                let kind = if content_type.is_empty() { "unknown" } else { &content_type };
                format!("<<binary {kind} omitted>>")
            };
            self.trace.record_response(
                &trace_id,
                &method,
                &url,
                status,
                started.elapsed().as_millis() as u64,
                &headers,
                &preview,
            );
        }

        Ok(TracedResponse {
            status,
            bytes,
        })
    }

    /// Mirror `Set-Cookie` headers into the persisted cookie tuples. The
    /// jar picks them up on its own; this copy exists so the session file
    /// can round-trip them.
    fn capture_cookies(&self, headers: &HeaderMap) {
        let mut parsed = Vec::new();
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(text) = value.to_str() {
                if let Some(record) = parse_set_cookie(text) {
                    parsed.push(record);
                }
            }
        }
        if parsed.is_empty() {
            return;
        }
        let mut session = self.session.lock().unwrap();
        for record in parsed {
            if let Some(existing) = session.cookies.iter_mut().find(|c| c.name == record.name) {
                *existing = record;
            } else {
                session.cookies.push(record);
            }
        }
    }

    pub(crate) async fn get_traced(&self, url: &str) -> Result<TracedResponse> {
        let req = self.http.get(url).build()?;
        self.execute_traced(req, None).await
    }
}

pub(crate) struct TracedResponse {
    pub status: u16,
    pub bytes: Vec<u8>,
}

impl TracedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn parse_set_cookie(raw: &str) -> Option<CookieRecord> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    let mut record = CookieRecord {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain: None,
        path: None,
        expires: None,
    };
    for attr in parts {
        let attr = attr.trim();
        if let Some((k, v)) = attr.split_once('=') {
            match k.trim().to_ascii_lowercase().as_str() {
                "domain" => record.domain = Some(v.trim().to_string()),
                "path" => record.path = Some(v.trim().to_string()),
                "expires" => record.expires = Some(v.trim().to_string()),
                _ => {}
            }
        }
    }
    Some(record)
}

/// Millisecond timestamp used in upstream query strings.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The upstream expects `r`/`rr` values built by bitwise-negating the clock.
pub(crate) fn neg(ts: i64) -> i64 {
    !ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_keeps_attrs() {
        let c = parse_set_cookie(
            "webwx_data_ticket=abc123; Domain=.qq.com; Path=/; Expires=Fri, 01 Jan 2027 00:00:00 GMT",
        )
        .unwrap();
        assert_eq!(c.name, "webwx_data_ticket");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.domain.as_deref(), Some(".qq.com"));
        assert_eq!(c.path.as_deref(), Some("/"));
        assert!(c.expires.unwrap().contains("2027"));
    }

    #[test]
    fn set_cookie_parsing_rejects_garbage() {
        assert!(parse_set_cookie("no-equals-here").is_none());
        assert!(parse_set_cookie("=orphan-value").is_none());
    }

    #[test]
    fn neg_matches_bitwise_not() {
        assert_eq!(neg(0), -1);
        assert_eq!(neg(1_700_000_000), -1_700_000_001);
    }
}
