//! Authentication state and its on-disk form.
//!
//! The session is written as a single indented UTF-8 JSON document after
//! every state-changing interaction and reloaded at boot. Cookies are kept
//! as plain tuples because reqwest's jar cannot be iterated; the engine
//! captures `Set-Cookie` headers itself and replays them on restore.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::hosts::resolve_hosts;

/// Opaque sync cursor returned by the upstream; required for every
/// sync-check and sync call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncKey {
    #[serde(rename = "Count", default)]
    pub count: i64,
    #[serde(rename = "List", default)]
    pub list: Vec<SyncKeyItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncKeyItem {
    #[serde(rename = "Key")]
    pub key: i64,
    #[serde(rename = "Val")]
    pub val: i64,
}

impl SyncKey {
    /// `Key_Val|Key_Val|…` form used by the synccheck query string.
    pub fn to_check_string(&self) -> String {
        self.list
            .iter()
            .map(|item| format!("{}_{}", item.key, item.val))
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// One persisted cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
}

impl CookieRecord {
    /// Rebuild a `Set-Cookie`-style string for replay into a cookie jar.
    pub fn to_cookie_str(&self) -> String {
        let mut s = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            s.push_str("; Domain=");
            s.push_str(domain);
        }
        s.push_str("; Path=");
        s.push_str(self.path.as_deref().unwrap_or("/"));
        s
    }
}

/// Everything needed to talk to the upstream as an authenticated client.
///
/// `{skey, sid, uin, pass_ticket}` are all-or-nothing: if any is missing the
/// engine is unauthenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub entry_host: String,
    #[serde(skip)]
    pub login_host: String,
    #[serde(skip)]
    pub file_host: String,
    pub device_id: String,
    #[serde(default)]
    pub uuid: String,
    /// Unix seconds when the current QR uuid was acquired.
    #[serde(skip)]
    pub uuid_ts: i64,
    #[serde(default)]
    pub skey: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub uin: String,
    #[serde(default)]
    pub pass_ticket: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub synckey: SyncKey,
    #[serde(default)]
    pub cookies: Vec<CookieRecord>,
}

impl Session {
    pub fn new(entry_host: &str) -> Self {
        let (login_host, file_host) = resolve_hosts(entry_host);
        Self {
            entry_host: entry_host.to_string(),
            login_host,
            file_host,
            device_id: gen_device_id(),
            uuid: String::new(),
            uuid_ts: 0,
            skey: String::new(),
            sid: String::new(),
            uin: String::new(),
            pass_ticket: String::new(),
            user_name: String::new(),
            synckey: SyncKey::default(),
            cookies: Vec::new(),
        }
    }

    pub fn has_auth(&self) -> bool {
        !self.skey.is_empty()
            && !self.sid.is_empty()
            && !self.uin.is_empty()
            && !self.pass_ticket.is_empty()
    }

    pub fn clear_auth(&mut self) {
        self.skey.clear();
        self.sid.clear();
        self.uin.clear();
        self.pass_ticket.clear();
    }

    /// Point the session at a (possibly new) entry host, rederiving the
    /// login and file hosts.
    pub fn set_entry_host(&mut self, host: &str) {
        self.entry_host = host.to_string();
        let (login_host, file_host) = resolve_hosts(host);
        self.login_host = login_host;
        self.file_host = file_host;
    }

    /// `BaseRequest` object attached to every authenticated POST.
    pub fn base_request(&self) -> serde_json::Value {
        let uin: serde_json::Value = match self.uin.parse::<i64>() {
            Ok(n) => n.into(),
            Err(_) => self.uin.clone().into(),
        };
        serde_json::json!({
            "Uin": uin,
            "Sid": self.sid,
            "Skey": self.skey,
            "DeviceID": self.device_id,
        })
    }

    /// Write the session document (indented UTF-8 JSON).
    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = serde_json::to_string_pretty(self)?;
        std::fs::write(path, doc)?;
        Ok(())
    }

    /// Load a previously saved document; rederives the transient hosts.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut session: Session = serde_json::from_str(&raw)?;
        let (login_host, file_host) = resolve_hosts(&session.entry_host);
        session.login_host = login_host;
        session.file_host = file_host;
        if session.device_id.is_empty() {
            session.device_id = gen_device_id();
        }
        Ok(session)
    }
}

/// 15 random decimal digits, generated once per fresh session.
pub fn gen_device_id() -> String {
    let mut rng = rand::thread_rng();
    (0..15).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_fifteen_digits() {
        let id = gen_device_id();
        assert_eq!(id.len(), 15);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn auth_tokens_are_all_or_nothing() {
        let mut s = Session::new("szfilehelper.weixin.qq.com");
        assert!(!s.has_auth());
        s.skey = "@skey".into();
        s.sid = "sid".into();
        s.uin = "12345".into();
        assert!(!s.has_auth());
        s.pass_ticket = "ticket".into();
        assert!(s.has_auth());
        s.clear_auth();
        assert!(!s.has_auth());
    }

    #[test]
    fn synckey_check_string_joins_pairs() {
        let sk = SyncKey {
            count: 2,
            list: vec![
                SyncKeyItem { key: 1, val: 100 },
                SyncKeyItem { key: 2, val: 200 },
            ],
        };
        assert_eq!(sk.to_check_string(), "1_100|2_200");
        assert_eq!(SyncKey::default().to_check_string(), "");
    }

    #[test]
    fn save_load_round_trips_modulo_transients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut s = Session::new("szfilehelper.weixin.qq.com");
        s.skey = "@sk".into();
        s.sid = "si".into();
        s.uin = "99".into();
        s.pass_ticket = "pt".into();
        s.user_name = "@robot".into();
        s.synckey = SyncKey {
            count: 1,
            list: vec![SyncKeyItem { key: 1, val: 7 }],
        };
        s.cookies.push(CookieRecord {
            name: "webwx_data_ticket".into(),
            value: "tkt".into(),
            domain: Some(".qq.com".into()),
            path: Some("/".into()),
            expires: None,
        });
        s.save(&path).unwrap();

        let loaded = Session::load(&path).unwrap();
        assert_eq!(loaded.entry_host, s.entry_host);
        assert_eq!(loaded.device_id, s.device_id);
        assert_eq!(loaded.skey, s.skey);
        assert_eq!(loaded.synckey, s.synckey);
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(loaded.login_host, "login.wx2.qq.com");
    }

    #[test]
    fn base_request_uses_numeric_uin_when_possible() {
        let mut s = Session::new("x");
        s.uin = "4242".into();
        let br = s.base_request();
        assert_eq!(br["Uin"], 4242);
        s.uin = "not-a-number".into();
        assert_eq!(s.base_request()["Uin"], "not-a-number");
    }
}
