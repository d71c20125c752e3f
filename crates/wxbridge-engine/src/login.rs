//! QR login flow: uuid acquisition, the login long-poll, redirect
//! completion, and the authenticated `webwxinit` handshake.
//!
//! Poll codes: 408 = awaiting scan, 201 = scanned awaiting confirm,
//! 200 = authorized (body carries the redirect URI), 400/500/0 = uuid
//! expired.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::{neg, now_ms, Engine};
use crate::error::{EngineError, Result};
use crate::hosts::{APP_ID, LANG, QR_HOST};
use crate::sync::SyncStatus;

/// A QR uuid is good for roughly this long before the server expires it.
const UUID_TTL_SECS: i64 = 240;

pub(crate) const MSG_INIT: &str = "init";
pub(crate) const MSG_NEED_QR: &str = "need_qr";
pub(crate) const MSG_QR_READY: &str = "qr_ready";
pub(crate) const MSG_WAIT_SCAN: &str = "qr_wait_scan";
pub(crate) const MSG_SCANNED: &str = "scanned_wait_confirm";
pub(crate) const MSG_AUTHORIZED: &str = "authorized";
pub(crate) const MSG_QR_EXPIRED: &str = "qr_expired";
pub(crate) const MSG_LOGGED_IN: &str = "logged_in";
pub(crate) const MSG_LOGGED_IN_CACHED: &str = "logged_in_cached";
pub(crate) const MSG_LOGGED_OUT: &str = "logged_out";

/// Login state machine. `QrExpired` and `LoggedOut` both loop back to
/// `NeedQr` on the next QR acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPhase {
    Unstarted,
    NeedQr,
    QrReady,
    Scanned,
    Authorized,
    LoggedIn,
    QrExpired,
    LoggedOut,
}

/// Last observed login-poll state, surfaced by `/login/status`.
#[derive(Debug)]
pub struct LoginProgress {
    pub phase: LoginPhase,
    pub code: i64,
    pub message: &'static str,
}

impl LoginProgress {
    pub fn new() -> Self {
        Self {
            phase: LoginPhase::Unstarted,
            code: 0,
            message: MSG_INIT,
        }
    }

    pub(crate) fn set(&mut self, phase: LoginPhase, code: i64, message: &'static str) {
        self.phase = phase;
        self.code = code;
        self.message = message;
    }

    pub(crate) fn set_logged_out(&mut self) {
        self.set(LoginPhase::LoggedOut, 0, MSG_LOGGED_OUT);
    }
}

impl Default for LoginProgress {
    fn default() -> Self {
        Self::new()
    }
}

static RE_UUID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"window\.QRLogin\.uuid\s*=\s*"([^"]+)""#).unwrap());
static RE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"window\.code\s*=\s*(\d+)").unwrap());
static RE_REDIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"window\.redirect_uri\s*=\s*"([^"]+)""#).unwrap());

pub(crate) fn parse_uuid(body: &str) -> Option<String> {
    RE_UUID.captures(body).map(|c| c[1].to_string())
}

pub(crate) fn parse_login_code(body: &str) -> i64 {
    RE_CODE
        .captures(body)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

pub(crate) fn parse_redirect_uri(body: &str) -> Option<String> {
    RE_REDIRECT.captures(body).map(|c| c[1].to_string())
}

/// First `<tag>…</tag>` body in `xml`, or empty.
pub(crate) fn extract_xml_tag(xml: &str, tag: &str) -> String {
    let re = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("xml tag pattern");
    re.captures(xml)
        .map(|c| c[1].to_string())
        .unwrap_or_default()
}

impl Engine {
    /// Probe or advance the login flow. With `poll=false` only the cached
    /// credentials are consulted; with `poll=true` the engine also runs a
    /// synccheck (when authenticated) or one login-poll round (when a QR
    /// uuid is outstanding).
    pub async fn check_login_status(&self, poll: bool) -> bool {
        let has_auth = self.has_auth();
        if has_auth {
            if !poll {
                self.set_logged_in(true);
                let mut progress = self.progress.lock().unwrap();
                progress.code = 200;
                if matches!(progress.message, MSG_INIT | MSG_NEED_QR | MSG_QR_EXPIRED) {
                    progress.set(LoginPhase::LoggedIn, 200, MSG_LOGGED_IN_CACHED);
                } else {
                    progress.phase = LoginPhase::LoggedIn;
                }
                return true;
            }

            match self.synccheck().await {
                SyncStatus::HasMsg => {
                    if let Err(e) = self.webwxsync().await {
                        warn!("sync during login probe failed: {e}");
                    }
                    self.confirm_logged_in().await;
                    return true;
                }
                SyncStatus::Wait => {
                    self.confirm_logged_in().await;
                    return true;
                }
                // loginout / resync fall through to the QR poll below.
                SyncStatus::LoginOut | SyncStatus::Resync => {}
            }
        }

        let uuid = self.session.lock().unwrap().uuid.clone();
        if poll && !uuid.is_empty() {
            let code = self.poll_login_once().await;
            if code == 200 {
                self.set_logged_in(true);
                self.progress
                    .lock()
                    .unwrap()
                    .set(LoginPhase::LoggedIn, 200, MSG_LOGGED_IN);
                self.notify_login_callback_if_needed().await;
                if let Err(e) = self.save_session() {
                    warn!("session save after login failed: {e}");
                }
                return true;
            }
        }

        self.set_logged_in(false);
        if self.session.lock().unwrap().uuid.is_empty() {
            let mut progress = self.progress.lock().unwrap();
            if progress.phase != LoginPhase::QrExpired && progress.phase != LoginPhase::LoggedOut {
                let code = progress.code;
                progress.set(LoginPhase::NeedQr, code, MSG_NEED_QR);
            }
        }
        false
    }

    async fn confirm_logged_in(&self) {
        self.set_logged_in(true);
        self.progress
            .lock()
            .unwrap()
            .set(LoginPhase::LoggedIn, 200, MSG_LOGGED_IN);
        self.notify_login_callback_if_needed().await;
    }

    /// PNG bytes of the current login QR code, acquiring a fresh uuid when
    /// none is outstanding or the old one aged out. Returns an empty vec
    /// when already logged in.
    pub async fn get_login_qr(&self) -> Result<Vec<u8>> {
        if self.check_login_status(true).await {
            return Ok(Vec::new());
        }

        let needs_new = {
            let session = self.session.lock().unwrap();
            session.uuid.is_empty()
                || chrono::Utc::now().timestamp() - session.uuid_ts > UUID_TTL_SECS
        };
        if needs_new {
            self.jslogin_get_uuid().await?;
            self.progress
                .lock()
                .unwrap()
                .set(LoginPhase::QrReady, 0, MSG_QR_READY);
        }

        let uuid = self.session.lock().unwrap().uuid.clone();
        let resp = self
            .get_traced(&format!("https://{QR_HOST}/qrcode/{uuid}"))
            .await?;
        if !resp.is_success() {
            return Err(EngineError::Protocol(format!(
                "qrcode fetch failed with status {}",
                resp.status
            )));
        }
        Ok(resp.bytes)
    }

    /// Acquire a new QR uuid from the login host.
    pub(crate) async fn jslogin_get_uuid(&self) -> Result<()> {
        let (login_host, entry_host) = {
            let session = self.session.lock().unwrap();
            (session.login_host.clone(), session.entry_host.clone())
        };
        let redirect = urlencoding::encode(&format!(
            "https://{entry_host}/cgi-bin/mmwebwx-bin/webwxnewloginpage"
        ))
        .into_owned();
        let url = format!(
            "https://{login_host}/jslogin?appid={APP_ID}&redirect_uri={redirect}&fun=new&lang={LANG}&_={}",
            now_ms()
        );

        let resp = self.get_traced(&url).await?;
        let body = resp.text();
        let uuid = parse_uuid(&body).ok_or_else(|| {
            let head: String = body.chars().take(200).collect();
            EngineError::Protocol(format!("cannot parse uuid from jslogin response: {head}"))
        })?;

        let mut session = self.session.lock().unwrap();
        session.uuid = uuid;
        session.uuid_ts = chrono::Utc::now().timestamp();
        info!("login uuid acquired");
        Ok(())
    }

    /// One round of the login long-poll. Returns the observed code; 0 on
    /// transport failure (uuid left intact for the next round).
    pub(crate) async fn poll_login_once(&self) -> i64 {
        let (login_host, uuid) = {
            let session = self.session.lock().unwrap();
            (session.login_host.clone(), session.uuid.clone())
        };
        if uuid.is_empty() {
            return 0;
        }

        let now = now_ms();
        let url = format!(
            "https://{login_host}/cgi-bin/mmwebwx-bin/login?loginicon=true&uuid={}&tip=1&r={}&_={}&appid={APP_ID}",
            urlencoding::encode(&uuid),
            neg(chrono::Utc::now().timestamp()),
            now
        );

        let body = match self.get_traced(&url).await {
            Ok(resp) if resp.is_success() => resp.text(),
            _ => return 0,
        };

        let code = parse_login_code(&body);
        self.progress.lock().unwrap().code = code;

        match code {
            200 => {
                if let Some(redirect_uri) = parse_redirect_uri(&body) {
                    match self.complete_login(&redirect_uri).await {
                        Ok(()) => {
                            self.progress.lock().unwrap().set(
                                LoginPhase::Authorized,
                                200,
                                MSG_AUTHORIZED,
                            );
                        }
                        Err(e) => {
                            warn!("login completion failed: {e}");
                            return 0;
                        }
                    }
                }
            }
            201 => {
                self.progress
                    .lock()
                    .unwrap()
                    .set(LoginPhase::Scanned, 201, MSG_SCANNED);
            }
            408 => {
                self.progress
                    .lock()
                    .unwrap()
                    .set(LoginPhase::QrReady, 408, MSG_WAIT_SCAN);
            }
            400 | 500 | 0 => {
                self.session.lock().unwrap().uuid.clear();
                self.progress
                    .lock()
                    .unwrap()
                    .set(LoginPhase::QrExpired, code, MSG_QR_EXPIRED);
            }
            other => {
                warn!(code = other, "unexpected login poll code");
            }
        }

        code
    }

    /// Follow the authorized redirect: reassign the entry host from its
    /// netloc, fetch `webwxnewloginpage`, and extract the four auth tokens.
    pub(crate) async fn complete_login(&self, redirect_uri: &str) -> Result<()> {
        let parsed = reqwest::Url::parse(redirect_uri)
            .map_err(|e| EngineError::Protocol(format!("bad redirect uri: {e}")))?;
        let mut ticket = String::new();
        let mut uuid_q = String::new();
        let mut lang_q = String::new();
        let mut scan = String::new();
        for (k, v) in parsed.query_pairs() {
            match k.as_ref() {
                "ticket" => ticket = v.into_owned(),
                "uuid" => uuid_q = v.into_owned(),
                "lang" => lang_q = v.into_owned(),
                "scan" => scan = v.into_owned(),
                _ => {}
            }
        }

        let domain = {
            let mut session = self.session.lock().unwrap();
            if let Some(host) = parsed.host_str() {
                session.set_entry_host(host);
            }
            if uuid_q.is_empty() {
                uuid_q = session.uuid.clone();
            }
            session.entry_host.clone()
        };
        if lang_q.is_empty() {
            lang_q = LANG.to_string();
        }

        let url = format!("https://{domain}/cgi-bin/mmwebwx-bin/webwxnewloginpage");
        let req = self
            .http
            .get(&url)
            .query(&[
                ("fun", "new"),
                ("version", "v2"),
                ("ticket", ticket.as_str()),
                ("uuid", uuid_q.as_str()),
                ("lang", lang_q.as_str()),
                ("scan", scan.as_str()),
            ])
            .header("mmweb_appid", APP_ID)
            .build()?;
        let resp = self.execute_traced(req, None).await?;
        let xml = resp.text();

        let skey = extract_xml_tag(&xml, "skey");
        let sid = extract_xml_tag(&xml, "wxsid");
        let uin = extract_xml_tag(&xml, "wxuin");
        let pass_ticket = extract_xml_tag(&xml, "pass_ticket");
        if skey.is_empty() || sid.is_empty() || uin.is_empty() || pass_ticket.is_empty() {
            return Err(EngineError::Protocol(
                "webwxnewloginpage missing auth fields".to_string(),
            ));
        }

        {
            let mut session = self.session.lock().unwrap();
            session.skey = skey;
            session.sid = sid;
            session.uin = uin;
            session.pass_ticket = pass_ticket;
        }

        self.webwxinit().await?;

        self.set_logged_in(true);
        self.progress
            .lock()
            .unwrap()
            .set(LoginPhase::LoggedIn, 200, MSG_LOGGED_IN);
        self.login_callback_sent
            .store(false, std::sync::atomic::Ordering::Relaxed);
        info!("login completed");
        Ok(())
    }

    /// Authenticated init: confirms the tokens and seeds the sync cursor
    /// and the robot's own user name. Failure here is a login failure.
    pub(crate) async fn webwxinit(&self) -> Result<()> {
        let (entry_host, pass_ticket, base_request) = {
            let session = self.session.lock().unwrap();
            (
                session.entry_host.clone(),
                session.pass_ticket.clone(),
                session.base_request(),
            )
        };

        let url = format!("https://{entry_host}/cgi-bin/mmwebwx-bin/webwxinit");
        let req = self
            .http
            .post(&url)
            .query(&[
                ("r", neg(now_ms()).to_string()),
                ("lang", LANG.to_string()),
                ("pass_ticket", pass_ticket),
            ])
            .header("mmweb_appid", APP_ID)
            .json(&json!({ "BaseRequest": base_request }))
            .build()?;
        let resp = self.execute_traced(req, None).await?;
        let data = resp.json()?;

        let ret = data["BaseResponse"]["Ret"].as_i64().unwrap_or(-1);
        if ret != 0 {
            return Err(EngineError::Protocol(format!("webwxinit rejected: Ret={ret}")));
        }

        let mut session = self.session.lock().unwrap();
        if let Some(name) = data["User"]["UserName"].as_str() {
            if !name.is_empty() {
                session.user_name = name.to_string();
            }
        }
        if let Some(uin) = data["User"]["Uin"].as_i64() {
            if uin != 0 {
                session.uin = uin.to_string();
            }
        }
        if data.get("SyncKey").is_some() {
            if let Ok(synckey) = serde_json::from_value(data["SyncKey"].clone()) {
                session.synckey = synckey;
            }
        }
        Ok(())
    }

    /// Fire `LOGIN_CALLBACK_URL` once per login success.
    pub(crate) async fn notify_login_callback_if_needed(&self) {
        use std::sync::atomic::Ordering;

        if self.opts.login_callback_url.is_empty()
            || self.login_callback_sent.load(Ordering::Relaxed)
            || !self.is_logged_in()
        {
            return;
        }

        let (uin, user_name, entry_host) = {
            let session = self.session.lock().unwrap();
            (
                session.uin.clone(),
                session.user_name.clone(),
                session.entry_host.clone(),
            )
        };
        let payload = json!({
            "event": "login_success",
            "uin": uin,
            "user_name": user_name,
            "entry_host": entry_host,
            "ts": chrono::Utc::now().timestamp(),
        });

        let req = match self
            .http
            .post(&self.opts.login_callback_url)
            .json(&payload)
            .build()
        {
            Ok(req) => req,
            Err(e) => {
                warn!("login callback build failed: {e}");
                return;
            }
        };
        match self.execute_traced(req, None).await {
            Ok(resp) if resp.is_success() => {
                self.login_callback_sent.store(true, Ordering::Relaxed);
            }
            Ok(resp) => warn!(status = resp.status, "login callback rejected"),
            Err(e) => warn!("login callback failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_parses_from_jslogin_body() {
        let body = r#"window.QRLogin.code = 200; window.QRLogin.uuid = "Qd1abc-XYZ";"#;
        assert_eq!(parse_uuid(body).as_deref(), Some("Qd1abc-XYZ"));
        assert!(parse_uuid("window.QRLogin.code = 400;").is_none());
    }

    #[test]
    fn login_code_parses_with_default_zero() {
        assert_eq!(parse_login_code("window.code = 408;"), 408);
        assert_eq!(parse_login_code("window.code=201"), 201);
        assert_eq!(parse_login_code("nothing here"), 0);
    }

    #[test]
    fn redirect_uri_parses_from_authorized_body() {
        let body = r#"window.code = 200;
window.redirect_uri = "https://szfilehelper.weixin.qq.com/cgi-bin/mmwebwx-bin/webwxnewloginpage?ticket=T&uuid=U&lang=zh_CN&scan=1";"#;
        let uri = parse_redirect_uri(body).unwrap();
        assert!(uri.contains("ticket=T"));
        assert!(uri.contains("uuid=U"));
    }

    #[test]
    fn xml_tags_extract_with_multiline_bodies() {
        let xml = "<error><ret>0</ret><skey>@crypt_abc</skey>\n<wxsid>SID+/=</wxsid><wxuin>123456</wxuin><pass_ticket>PT%2B</pass_ticket></error>";
        assert_eq!(extract_xml_tag(xml, "skey"), "@crypt_abc");
        assert_eq!(extract_xml_tag(xml, "wxsid"), "SID+/=");
        assert_eq!(extract_xml_tag(xml, "wxuin"), "123456");
        assert_eq!(extract_xml_tag(xml, "pass_ticket"), "PT%2B");
        assert_eq!(extract_xml_tag(xml, "missing"), "");
    }

    #[test]
    fn progress_starts_unstarted() {
        let p = LoginProgress::new();
        assert_eq!(p.phase, LoginPhase::Unstarted);
        assert_eq!(p.message, "init");
        assert_eq!(p.code, 0);
    }
}
