//! Attachment download. The raw upstream record (cached during sync) holds
//! the attributes the download URLs need (`MediaId`, `EncryFileName`), so
//! only ids that went through a sync round are downloadable.

use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::hosts::APP_ID;

fn json_str(value: &Value, key: &str) -> String {
    value[key]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| value[key].as_i64().map(|n| n.to_string()))
        .unwrap_or_default()
}

/// `webwxgetmsgimg` URL for an image message (served by the entry host).
pub(crate) fn image_download_url(entry_host: &str, raw: &Value, skey: &str) -> String {
    format!(
        "https://{entry_host}/cgi-bin/mmwebwx-bin/webwxgetmsgimg?MsgID={}&skey={}&type=slave&mmweb_appid={APP_ID}",
        json_str(raw, "MsgId"),
        urlencoding::encode(skey),
    )
}

/// `webwxgetmedia` URL for a file attachment (served by the file host).
pub(crate) fn media_download_url(
    file_host: &str,
    raw: &Value,
    uin: &str,
    pass_ticket: &str,
    data_ticket: &str,
    sid: &str,
) -> String {
    format!(
        "https://{file_host}/cgi-bin/mmwebwx-bin/webwxgetmedia?sender={}&mediaid={}&encryfilename={}&fromuser={}&pass_ticket={}&webwx_data_ticket={}&sid={}&mmweb_appid={APP_ID}",
        urlencoding::encode(&json_str(raw, "FromUserName")),
        urlencoding::encode(&json_str(raw, "MediaId")),
        urlencoding::encode(&json_str(raw, "EncryFileName")),
        urlencoding::encode(uin),
        urlencoding::encode(pass_ticket),
        urlencoding::encode(data_ticket),
        urlencoding::encode(sid),
    )
}

impl Engine {
    /// Download an attachment's content to `save_path`.
    pub async fn download_message_content(&self, msg_id: &str, save_path: &Path) -> Result<()> {
        if !self.check_login_status(false).await {
            return Err(EngineError::NotLoggedIn);
        }

        let raw = self
            .raw_by_id
            .lock()
            .unwrap()
            .get(msg_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMessage(msg_id.to_string()))?;

        let msg_type = raw["MsgType"].as_i64().unwrap_or(0);
        let app_msg_type = raw["AppMsgType"].as_i64();

        let url = match (msg_type, app_msg_type) {
            (3, _) => {
                let (entry_host, skey) = {
                    let session = self.session.lock().unwrap();
                    (session.entry_host.clone(), session.skey.clone())
                };
                image_download_url(&entry_host, &raw, &skey)
            }
            (49, Some(6)) => {
                let (file_host, uin, pass_ticket, sid) = {
                    let session = self.session.lock().unwrap();
                    (
                        session.file_host.clone(),
                        session.uin.clone(),
                        session.pass_ticket.clone(),
                        session.sid.clone(),
                    )
                };
                let data_ticket = self.get_cookie("webwx_data_ticket").unwrap_or_default();
                media_download_url(&file_host, &raw, &uin, &pass_ticket, &data_ticket, &sid)
            }
            _ => {
                return Err(EngineError::Protocol(format!(
                    "message {msg_id} has no downloadable content (MsgType={msg_type})"
                )))
            }
        };

        let resp = self.get_traced(&url).await?;
        if !resp.is_success() {
            return Err(EngineError::Protocol(format!(
                "download failed with status {}",
                resp.status
            )));
        }

        if let Some(parent) = save_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(save_path, &resp.bytes).await?;
        info!(msg_id, path = %save_path.display(), bytes = resp.bytes.len(), "attachment downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_url_targets_entry_host_with_slave_type() {
        let raw = json!({ "MsgId": "77", "MsgType": 3 });
        let url = image_download_url("szfilehelper.weixin.qq.com", &raw, "@crypt/ab+c");
        assert!(url.starts_with("https://szfilehelper.weixin.qq.com/cgi-bin/mmwebwx-bin/webwxgetmsgimg?"));
        assert!(url.contains("MsgID=77"));
        assert!(url.contains("type=slave"));
        // skey must be percent-encoded
        assert!(url.contains("skey=%40crypt%2Fab%2Bc"));
    }

    #[test]
    fn media_url_carries_every_required_ticket() {
        let raw = json!({
            "MsgId": "88",
            "MsgType": 49,
            "AppMsgType": 6,
            "FromUserName": "filehelper",
            "MediaId": "MID==",
            "EncryFileName": "enc name.pdf",
        });
        let url = media_download_url("file.wx2.qq.com", &raw, "123", "pt", "ticket", "sid");
        assert!(url.starts_with("https://file.wx2.qq.com/cgi-bin/mmwebwx-bin/webwxgetmedia?"));
        assert!(url.contains("sender=filehelper"));
        assert!(url.contains("mediaid=MID%3D%3D"));
        assert!(url.contains("encryfilename=enc%20name.pdf"));
        assert!(url.contains("fromuser=123"));
        assert!(url.contains("webwx_data_ticket=ticket"));
        assert!(url.contains("sid=sid"));
    }
}
