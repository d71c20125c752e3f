//! Outbound messaging: text sends and the three-phase file send
//! (MIME sniff → MD5 + multipart upload → send-image / send-app-message).

use std::path::Path;

use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::hosts::{APP_ID, LANG, TO_USER};

/// Client message id: millisecond timestamp plus three random digits.
pub(crate) fn gen_msg_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}{}",
        chrono::Utc::now().timestamp_millis(),
        rng.gen_range(100..1000)
    )
}

fn random_string(n: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// The upstream id assigned to a send, if the response carried one.
fn sent_msg_id(data: &Value) -> String {
    data["MsgID"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| data["MsgID"].as_i64().map(|n| n.to_string()))
        .unwrap_or_default()
}

/// Fixed-shape app-message XML wrapping an uploaded attachment.
pub(crate) fn build_appmsg_xml(file_name: &str, file_size: u64, media_id: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    format!(
        "<appmsg appid='wxeb7ec651dd0aefa9' sdkver=''><title>{file_name}</title>\
<des></des><action></action><type>6</type><content></content><url></url>\
<lowurl></lowurl><appattach><totallen>{file_size}</totallen>\
<attachid>{media_id}</attachid><fileext>{ext}</fileext></appattach>\
<extinfo></extinfo></appmsg>"
    )
}

impl Engine {
    /// Send a text message to the file transfer assistant. Returns the
    /// upstream-assigned message id (also recorded in the self-sent set).
    pub async fn send_text(&self, message: &str) -> Result<String> {
        if message.is_empty() {
            return Err(EngineError::Protocol("empty message".to_string()));
        }
        if !self.check_login_status(false).await {
            return Err(EngineError::NotLoggedIn);
        }

        let _guard = self.send_lock.lock().await;
        let pass_ticket = self.session.lock().unwrap().pass_ticket.clone();
        let url_path = format!(
            "/cgi-bin/mmwebwx-bin/webwxsendmsg?lang={LANG}&pass_ticket={}",
            urlencoding::encode(&pass_ticket)
        );
        let data = self
            .post_message(&url_path, json!({ "Type": 1, "Content": message }))
            .await?;
        Ok(sent_msg_id(&data))
    }

    /// Upload `file_path` and send it. Oversized files are rejected before
    /// any network traffic. Returns the upstream-assigned message id.
    pub async fn send_file(&self, file_path: &Path) -> Result<String> {
        if !self.check_login_status(false).await {
            return Err(EngineError::NotLoggedIn);
        }

        let meta = tokio::fs::metadata(file_path)
            .await
            .map_err(|_| EngineError::FileNotFound(file_path.display().to_string()))?;
        let file_size = meta.len();
        if file_size > self.opts.max_upload_size {
            return Err(EngineError::FileTooLarge {
                size: file_size,
                max: self.opts.max_upload_size,
            });
        }

        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let mime = mime_guess::from_path(file_path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let media_type = if mime.starts_with("image/") { "pic" } else { "doc" };

        let bytes = tokio::fs::read(file_path).await?;
        let file_md5 = format!("{:x}", md5::compute(&bytes));
        let client_media_id = gen_msg_id();

        let _guard = self.send_lock.lock().await;
        let media_id = self
            .webwxuploadmedia(&file_name, bytes, &mime, media_type, &file_md5, &client_media_id)
            .await?;

        let pass_ticket = self.session.lock().unwrap().pass_ticket.clone();
        let (url_path, msg_fields) = if media_type == "pic" {
            (
                format!(
                    "/cgi-bin/mmwebwx-bin/webwxsendmsgimg?fun=async&f=json&pass_ticket={}",
                    urlencoding::encode(&pass_ticket)
                ),
                json!({ "MediaId": media_id, "Type": 3, "Content": "" }),
            )
        } else {
            let xml = build_appmsg_xml(&file_name, file_size, &media_id);
            (
                format!(
                    "/cgi-bin/mmwebwx-bin/webwxsendappmsg?fun=async&f=json&lang={LANG}&pass_ticket={}",
                    urlencoding::encode(&pass_ticket)
                ),
                json!({ "Type": 6, "Content": xml }),
            )
        };

        let data = self.post_message(&url_path, msg_fields).await?;
        info!(%file_name, file_size, "file sent");
        Ok(sent_msg_id(&data))
    }

    /// POST a `Msg` envelope (BaseRequest + client ids + routing) and record
    /// the returned upstream id in the self-sent set.
    pub(crate) async fn post_message(&self, url_path: &str, msg_fields: Value) -> Result<Value> {
        let (entry_host, base_request, user_name) = {
            let session = self.session.lock().unwrap();
            (
                session.entry_host.clone(),
                session.base_request(),
                session.user_name.clone(),
            )
        };

        let msg_id = gen_msg_id();
        let mut msg = json!({
            "ClientMsgId": msg_id,
            "LocalID": msg_id,
            "FromUserName": user_name,
            "ToUserName": TO_USER,
        });
        if let (Some(obj), Some(fields)) = (msg.as_object_mut(), msg_fields.as_object()) {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        let payload = json!({
            "BaseRequest": base_request,
            "Msg": msg,
            "Scene": 0,
        });

        let url = format!("https://{entry_host}{url_path}");
        let req = self
            .http
            .post(&url)
            .header("mmweb_appid", APP_ID)
            .json(&payload)
            .build()?;
        let resp = self.execute_traced(req, None).await?;
        let data = resp.json()?;

        let ret = data["BaseResponse"]["Ret"].as_i64().unwrap_or(-1);
        if ret != 0 {
            return Err(EngineError::Protocol(format!("send rejected: Ret={ret}")));
        }

        let sent_id = data["MsgID"]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| data["MsgID"].as_i64().map(|n| n.to_string()))
            .unwrap_or_default();
        if !sent_id.is_empty() {
            self.sent_ids.lock().unwrap().insert(sent_id);
        }
        Ok(data)
    }

    /// Multipart upload to the file host; returns the assigned `MediaId`.
    async fn webwxuploadmedia(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        mime: &str,
        media_type: &str,
        file_md5: &str,
        client_media_id: &str,
    ) -> Result<String> {
        let (file_host, base_request, user_name, pass_ticket) = {
            let session = self.session.lock().unwrap();
            (
                session.file_host.clone(),
                session.base_request(),
                session.user_name.clone(),
                session.pass_ticket.clone(),
            )
        };
        let data_ticket = self.get_cookie("webwx_data_ticket").unwrap_or_default();
        if data_ticket.is_empty() {
            warn!("webwx_data_ticket cookie missing");
        }

        let file_size = bytes.len() as u64;
        let upload_request = json!({
            "UploadType": 2,
            "BaseRequest": base_request,
            "ClientMediaId": client_media_id,
            "TotalLen": file_size,
            "StartPos": 0,
            "DataLen": file_size,
            "MediaType": 4,
            "FromUserName": user_name,
            "ToUserName": TO_USER,
            "FileMd5": file_md5,
        });

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .text("name", file_name.to_string())
            .text("type", mime.to_string())
            .text("lastModifiedDate", "Thu Jan 01 1970 08:00:00 GMT+0800")
            .text("size", file_size.to_string())
            .text("mediatype", media_type.to_string())
            .text("uploadmediarequest", upload_request.to_string())
            .text("webwx_data_ticket", data_ticket)
            .text("pass_ticket", pass_ticket)
            .part("filename", part);

        let url = format!(
            "https://{file_host}/cgi-bin/mmwebwx-bin/webwxuploadmedia?f=json&random={}",
            random_string(4)
        );
        let req = self
            .http
            .post(&url)
            .header("mmweb_appid", APP_ID)
            .multipart(form)
            .build()?;
        let resp = self.execute_traced(req, Some("<<multipart omitted>>")).await?;
        let result = resp.json()?;

        let ret = result["BaseResponse"]["Ret"].as_i64().unwrap_or(-1);
        if ret != 0 {
            return Err(EngineError::Protocol(format!("upload rejected: Ret={ret}")));
        }
        let media_id = result["MediaId"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_default();
        if media_id.is_empty() {
            return Err(EngineError::Protocol("upload returned no MediaId".to_string()));
        }
        Ok(media_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::trace::TraceOptions;
    use std::io::Write;

    fn engine_with_cap(max_upload_size: u64) -> Engine {
        Engine::new(EngineOptions {
            entry_host: "szfilehelper.weixin.qq.com".to_string(),
            state_path: std::env::temp_dir().join("wxbridge-send-test-state.json"),
            max_upload_size,
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

    fn fake_auth(e: &Engine) {
        let mut s = e.session.lock().unwrap();
        s.skey = "@sk".into();
        s.sid = "sid".into();
        s.uin = "1".into();
        s.pass_ticket = "pt".into();
    }

    #[test]
    fn msg_ids_are_numeric_and_unique_enough() {
        let a = gen_msg_id();
        let b = gen_msg_id();
        assert!(a.chars().all(|c| c.is_ascii_digit()));
        assert!(a.len() >= 16);
        // Random suffix makes collisions within one millisecond unlikely;
        // equality here would mean the suffix logic broke entirely.
        assert!(a != b || a.len() == b.len());
    }

    #[test]
    fn appmsg_xml_carries_name_size_and_ext() {
        let xml = build_appmsg_xml("report.pdf", 2048, "MEDIA123");
        assert!(xml.contains("<title>report.pdf</title>"));
        assert!(xml.contains("<totallen>2048</totallen>"));
        assert!(xml.contains("<attachid>MEDIA123</attachid>"));
        assert!(xml.contains("<fileext>pdf</fileext>"));
    }

    #[test]
    fn extensionless_files_get_bin_ext() {
        let xml = build_appmsg_xml("LICENSE", 10, "M");
        assert!(xml.contains("<fileext>bin</fileext>"));
    }

    #[tokio::test]
    async fn oversized_files_are_rejected_before_any_network() {
        let e = engine_with_cap(8);
        fake_auth(&e);

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"way more than eight bytes").unwrap();

        match e.send_file(tmp.path()).await {
            Err(EngineError::FileTooLarge { size, max }) => {
                assert_eq!(max, 8);
                assert!(size > 8);
            }
            other => panic!("expected FileTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_files_are_rejected() {
        let e = engine_with_cap(1024);
        fake_auth(&e);
        let err = e
            .send_file(Path::new("/nonexistent/wxbridge-test-file"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn unauthenticated_send_is_refused() {
        let e = engine_with_cap(1024);
        let err = e.send_text("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::NotLoggedIn));
    }
}
