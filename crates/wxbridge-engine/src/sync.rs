//! Sync-check long-poll, message sync, and normalization into
//! [`InboundMessage`] values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use wxbridge_core::types::{InboundMessage, MsgKind};

use crate::engine::{neg, now_ms, Engine};
use crate::error::Result;
use crate::hosts::{APP_ID, TO_USER};

/// Outcome of one `synccheck` round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// New messages are pending; follow up with a sync.
    HasMsg,
    /// Nothing new.
    Wait,
    /// The upstream invalidated the session.
    LoginOut,
    /// Transport failure; retry on the next tick without a state change.
    Resync,
}

static RE_RETCODE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"retcode\s*:\s*"?(\d+)"?"#).unwrap());
static RE_SELECTOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"selector\s*:\s*"?(\d+)"?"#).unwrap());

/// Map a synccheck body (`window.synccheck={retcode:"0",selector:"2"}`) to a
/// [`SyncStatus`].
pub(crate) fn parse_synccheck(body: &str) -> SyncStatus {
    let retcode = RE_RETCODE
        .captures(body)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let selector = RE_SELECTOR
        .captures(body)
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    if retcode != "0" {
        return SyncStatus::LoginOut;
    }
    if !selector.is_empty() && selector != "0" {
        return SyncStatus::HasMsg;
    }
    SyncStatus::Wait
}

impl Engine {
    /// One synccheck round against the entry host.
    pub async fn synccheck(&self) -> SyncStatus {
        let (entry_host, skey, sid, uin, device_id, synckey) = {
            let session = self.session.lock().unwrap();
            if session.skey.is_empty() || session.sid.is_empty() || session.uin.is_empty() {
                return SyncStatus::LoginOut;
            }
            (
                session.entry_host.clone(),
                session.skey.clone(),
                session.sid.clone(),
                session.uin.clone(),
                session.device_id.clone(),
                session.synckey.to_check_string(),
            )
        };

        let url = format!("https://{entry_host}/cgi-bin/mmwebwx-bin/synccheck");
        let req = match self
            .http
            .get(&url)
            .query(&[
                ("r", now_ms().to_string()),
                ("skey", skey),
                ("sid", sid),
                ("uin", uin),
                ("deviceid", device_id),
                ("synckey", synckey),
                ("mmweb_appid", APP_ID.to_string()),
            ])
            .build()
        {
            Ok(req) => req,
            Err(e) => {
                warn!("synccheck build failed: {e}");
                return SyncStatus::Resync;
            }
        };

        match self.execute_traced(req, None).await {
            Ok(resp) if resp.is_success() => parse_synccheck(&resp.text()),
            _ => SyncStatus::Resync,
        }
    }

    /// Fetch pending messages. Replaces the stored sync cursor with the one
    /// from the response and returns the newly normalized messages.
    pub async fn webwxsync(&self) -> Result<Vec<InboundMessage>> {
        let (entry_host, sid, skey, pass_ticket, base_request, synckey) = {
            let session = self.session.lock().unwrap();
            (
                session.entry_host.clone(),
                session.sid.clone(),
                session.skey.clone(),
                session.pass_ticket.clone(),
                session.base_request(),
                serde_json::to_value(&session.synckey)?,
            )
        };

        let url = format!("https://{entry_host}/cgi-bin/mmwebwx-bin/webwxsync");
        let req = self
            .http
            .post(&url)
            .query(&[("sid", sid), ("skey", skey), ("pass_ticket", pass_ticket)])
            .header("mmweb_appid", APP_ID)
            .json(&json!({
                "BaseRequest": base_request,
                "SyncKey": synckey,
                "rr": neg(now_ms()),
            }))
            .build()?;
        let resp = self.execute_traced(req, None).await?;
        let data = resp.json()?;

        let ret = data["BaseResponse"]["Ret"].as_i64().unwrap_or(-1);
        if ret != 0 {
            warn!(ret, "webwxsync rejected");
            return Ok(Vec::new());
        }

        if data.get("SyncKey").and_then(|v| v.get("List")).is_some() {
            if let Ok(synckey) = serde_json::from_value(data["SyncKey"].clone()) {
                self.session.lock().unwrap().synckey = synckey;
            }
        }

        let add_msg_list = data["AddMsgList"].as_array().cloned().unwrap_or_default();
        let normalized = self.normalize_add_msg_list(&add_msg_list);
        if !normalized.is_empty() {
            debug!(count = normalized.len(), "new messages from sync");
            let mut cache = self.msg_cache.lock().unwrap();
            for msg in &normalized {
                cache.push(msg.clone());
            }
        }
        Ok(normalized)
    }

    /// Apply the normalization table to a raw `AddMsgList` batch.
    ///
    /// Messages already seen (or produced by our own sends) are skipped;
    /// messages where neither side is the file transfer assistant are
    /// discarded. Every surviving raw record is cached by id for later
    /// attachment download, even when its kind is dropped.
    pub(crate) fn normalize_add_msg_list(&self, add_msg_list: &[Value]) -> Vec<InboundMessage> {
        let mut out = Vec::new();

        for item in add_msg_list {
            let msg_id = item["MsgId"]
                .as_str()
                .map(|s| s.to_string())
                .or_else(|| item["MsgId"].as_i64().map(|n| n.to_string()))
                .unwrap_or_default();
            if msg_id.is_empty() {
                continue;
            }
            {
                let seen = self.seen_ids.lock().unwrap();
                let sent = self.sent_ids.lock().unwrap();
                if seen.contains(&msg_id) || sent.contains(&msg_id) {
                    continue;
                }
            }

            let from_user = item["FromUserName"].as_str().unwrap_or("");
            let to_user = item["ToUserName"].as_str().unwrap_or("");
            if from_user != TO_USER && to_user != TO_USER {
                continue;
            }

            let msg_type = item["MsgType"].as_i64().unwrap_or(0);
            let app_msg_type = item["AppMsgType"].as_i64();
            let is_mine = from_user != TO_USER;

            let normalized = match (msg_type, app_msg_type) {
                (1, _) => {
                    let content = item["Content"].as_str().unwrap_or("");
                    Some(InboundMessage {
                        id: msg_id.clone(),
                        kind: MsgKind::Text,
                        text: html_escape::decode_html_entities(content).into_owned(),
                        file_name: None,
                        is_mine,
                        file_path: None,
                        file_size: None,
                        reply_to: None,
                    })
                }
                (3, _) => {
                    let file_name = item["FileName"]
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("img_{msg_id}.jpg"));
                    Some(InboundMessage {
                        id: msg_id.clone(),
                        kind: MsgKind::Image,
                        text: "[Image]".to_string(),
                        file_name: Some(file_name),
                        is_mine,
                        file_path: None,
                        file_size: None,
                        reply_to: None,
                    })
                }
                (49, Some(6)) => {
                    let file_name = item["FileName"]
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("file_{msg_id}"));
                    Some(InboundMessage {
                        id: msg_id.clone(),
                        kind: MsgKind::File,
                        text: format!("[File: {file_name}]"),
                        file_name: Some(file_name),
                        is_mine,
                        file_path: None,
                        file_size: None,
                        reply_to: None,
                    })
                }
                _ => None,
            };

            self.seen_ids.lock().unwrap().insert(msg_id.clone());
            self.raw_by_id.lock().unwrap().insert(msg_id, item.clone());

            if let Some(msg) = normalized {
                out.push(msg);
            }
        }

        out
    }

    /// The newest `limit` cached messages, oldest first, after running one
    /// sync round. Not-logged-in callers get a login probe instead.
    pub async fn get_latest_messages(&self, limit: usize) -> Vec<InboundMessage> {
        if !self.is_logged_in() {
            if !self.check_login_status(true).await {
                return Vec::new();
            }
        } else if !self.has_auth() {
            self.set_logged_in(false);
            return Vec::new();
        }

        match self.synccheck().await {
            SyncStatus::HasMsg => {
                if let Err(e) = self.webwxsync().await {
                    warn!("webwxsync failed: {e}");
                }
            }
            SyncStatus::LoginOut => {
                self.set_logged_in(false);
                return Vec::new();
            }
            SyncStatus::Wait | SyncStatus::Resync => {}
        }

        self.msg_cache.lock().unwrap().last_n(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::trace::TraceOptions;

    fn engine() -> Engine {
        Engine::new(EngineOptions {
            entry_host: "szfilehelper.weixin.qq.com".to_string(),
            state_path: std::env::temp_dir().join("wxbridge-test-state.json"),
            max_upload_size: 25 * 1024 * 1024,
            login_callback_url: String::new(),
            trace: TraceOptions {
                enabled: false,
                redact: true,
                max_body: 4096,
                dir: std::env::temp_dir(),
            },
        })
        .unwrap()
    }

    #[test]
    fn synccheck_body_maps_to_status() {
        assert_eq!(
            parse_synccheck(r#"window.synccheck={retcode:"0",selector:"2"}"#),
            SyncStatus::HasMsg
        );
        assert_eq!(
            parse_synccheck(r#"window.synccheck={retcode:"0",selector:"0"}"#),
            SyncStatus::Wait
        );
        assert_eq!(
            parse_synccheck(r#"window.synccheck={retcode:"1101",selector:"0"}"#),
            SyncStatus::LoginOut
        );
        assert_eq!(parse_synccheck("garbage"), SyncStatus::LoginOut);
    }

    #[test]
    fn text_messages_are_unescaped() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "42",
            "MsgType": 1,
            "FromUserName": "filehelper",
            "ToUserName": "@me",
            "Content": "a &amp; b &lt;c&gt;",
        })]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MsgKind::Text);
        assert_eq!(msgs[0].text, "a & b <c>");
        assert!(!msgs[0].is_mine);
    }

    #[test]
    fn image_gets_placeholder_and_default_name() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "77",
            "MsgType": 3,
            "FromUserName": "filehelper",
            "ToUserName": "@me",
        })]);
        assert_eq!(msgs[0].kind, MsgKind::Image);
        assert_eq!(msgs[0].text, "[Image]");
        assert_eq!(msgs[0].file_name.as_deref(), Some("img_77.jpg"));
    }

    #[test]
    fn app_message_type_six_is_a_file() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "88",
            "MsgType": 49,
            "AppMsgType": 6,
            "FileName": "report.pdf",
            "FromUserName": "filehelper",
            "ToUserName": "@me",
        })]);
        assert_eq!(msgs[0].kind, MsgKind::File);
        assert_eq!(msgs[0].text, "[File: report.pdf]");
    }

    #[test]
    fn unknown_kinds_are_dropped_but_raw_cached() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "99",
            "MsgType": 51,
            "FromUserName": "filehelper",
            "ToUserName": "@me",
        })]);
        assert!(msgs.is_empty());
        assert!(e.raw_by_id.lock().unwrap().get("99").is_some());
    }

    #[test]
    fn foreign_conversations_are_discarded() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "11",
            "MsgType": 1,
            "FromUserName": "@someone",
            "ToUserName": "@me",
            "Content": "hi",
        })]);
        assert!(msgs.is_empty());
        assert!(e.raw_by_id.lock().unwrap().get("11").is_none());
    }

    #[test]
    fn duplicates_and_self_sends_are_skipped() {
        let e = engine();
        let raw = serde_json::json!({
            "MsgId": "42",
            "MsgType": 1,
            "FromUserName": "filehelper",
            "ToUserName": "@me",
            "Content": "once",
        });
        assert_eq!(e.normalize_add_msg_list(&[raw.clone()]).len(), 1);
        assert!(e.normalize_add_msg_list(&[raw]).is_empty());

        e.sent_ids.lock().unwrap().insert("600");
        let echoed = serde_json::json!({
            "MsgId": "600",
            "MsgType": 1,
            "FromUserName": "@me",
            "ToUserName": "filehelper",
            "Content": "our own echo",
        });
        assert!(e.normalize_add_msg_list(&[echoed]).is_empty());
    }

    #[test]
    fn messages_from_us_are_marked_mine() {
        let e = engine();
        let msgs = e.normalize_add_msg_list(&[serde_json::json!({
            "MsgId": "12",
            "MsgType": 1,
            "FromUserName": "@me",
            "ToUserName": "filehelper",
            "Content": "typed on the phone",
        })]);
        assert!(msgs[0].is_mine);
    }
}
