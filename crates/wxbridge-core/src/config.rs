use std::path::PathBuf;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

/// Hard cap the upstream accepts for a single uploaded file.
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Top-level settings, populated from environment variables.
///
/// Field names map 1:1 to the (lowercased) variable names, so
/// `WECHAT_ENTRY_HOST` lands in `wechat_entry_host` without any prefix
/// handling. Everything is optional and has a usable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_entry_host")]
    pub wechat_entry_host: String,

    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// When true, attachments are stored under `YYYY-MM-DD/` subdirectories.
    #[serde(default = "bool_true", deserialize_with = "de_flag")]
    pub file_date_subdir: bool,
    #[serde(default = "bool_true", deserialize_with = "de_flag")]
    pub auto_download: bool,
    /// 0 keeps downloaded files forever.
    #[serde(default)]
    pub file_retention_days: u32,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    #[serde(default = "default_db_path")]
    pub message_db_path: PathBuf,
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    #[serde(default = "default_task_file")]
    pub robot_task_file: PathBuf,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default)]
    pub message_webhook_url: String,
    #[serde(default = "default_message_webhook_timeout")]
    pub message_webhook_timeout: u64,

    #[serde(default, deserialize_with = "de_flag")]
    pub chatbot_enabled: bool,
    #[serde(default)]
    pub chatbot_webhook_url: String,
    #[serde(default = "default_chatbot_timeout")]
    pub chatbot_timeout: u64,

    #[serde(default = "bool_true", deserialize_with = "de_flag")]
    pub wechat_trace_enabled: bool,
    #[serde(default = "bool_true", deserialize_with = "de_flag")]
    pub wechat_trace_redact: bool,
    #[serde(default = "default_trace_max_body")]
    pub wechat_trace_max_body: usize,
    #[serde(default = "default_trace_dir")]
    pub wechat_trace_dir: PathBuf,

    /// Comma-separated host allowlist for the outbound HTTP-GET helper.
    #[serde(default)]
    pub robot_http_allowlist: String,

    /// Fired once per successful login when non-empty.
    #[serde(default)]
    pub login_callback_url: String,

    #[serde(default)]
    pub robot_server_label: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wechat_entry_host: default_entry_host(),
            http_host: default_http_host(),
            http_port: default_http_port(),
            download_dir: default_download_dir(),
            file_date_subdir: true,
            auto_download: true,
            file_retention_days: 0,
            max_upload_size: default_max_upload_size(),
            message_db_path: default_db_path(),
            plugins_dir: default_plugins_dir(),
            robot_task_file: default_task_file(),
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            message_webhook_url: String::new(),
            message_webhook_timeout: default_message_webhook_timeout(),
            chatbot_enabled: false,
            chatbot_webhook_url: String::new(),
            chatbot_timeout: default_chatbot_timeout(),
            wechat_trace_enabled: true,
            wechat_trace_redact: true,
            wechat_trace_max_body: default_trace_max_body(),
            wechat_trace_dir: default_trace_dir(),
            robot_http_allowlist: String::new(),
            login_callback_url: String::new(),
            robot_server_label: String::new(),
        }
    }
}

impl Settings {
    /// Load settings: struct defaults overridden by raw environment variables.
    pub fn load() -> crate::error::Result<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::raw())
            .extract()
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Parsed `ROBOT_HTTP_ALLOWLIST` entries.
    pub fn http_allowlist(&self) -> Vec<String> {
        self.robot_http_allowlist
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Label reported in webhook payloads and /health.
    pub fn server_label(&self) -> String {
        if !self.robot_server_label.is_empty() {
            return self.robot_server_label.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "wxbridge".to_string())
    }

    /// Create the directories the runtime writes into.
    pub fn ensure_dirs(&self) -> crate::error::Result<()> {
        std::fs::create_dir_all(&self.download_dir)?;
        if self.wechat_trace_enabled {
            std::fs::create_dir_all(&self.wechat_trace_dir)?;
        }
        Ok(())
    }
}

/// Accept bools the way shell environments spell them: `true`/`false`,
/// `1`/`0`, `yes`/`no`, `on`/`off` (env values may arrive as strings or
/// already-typed TOML scalars).
fn de_flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    struct FlagVisitor;

    impl serde::de::Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a boolean-like value")
        }

        fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<bool, E> {
            Ok(v != 0)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<bool, E> {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" | "" => Ok(false),
                other => Err(E::custom(format!("not a boolean: {other}"))),
            }
        }
    }

    de.deserialize_any(FlagVisitor)
}

fn bool_true() -> bool {
    true
}
fn default_entry_host() -> String {
    "szfilehelper.weixin.qq.com".to_string()
}
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8000
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_max_upload_size() -> u64 {
    MAX_UPLOAD_BYTES
}
fn default_db_path() -> PathBuf {
    PathBuf::from("messages.db")
}
fn default_plugins_dir() -> PathBuf {
    PathBuf::from("plugins")
}
fn default_task_file() -> PathBuf {
    PathBuf::from("scheduled_tasks.json")
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_message_webhook_timeout() -> u64 {
    10
}
fn default_chatbot_timeout() -> u64 {
    20
}
fn default_trace_max_body() -> usize {
    4096
}
fn default_trace_dir() -> PathBuf {
    PathBuf::from("trace_logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.wechat_entry_host, "szfilehelper.weixin.qq.com");
        assert_eq!(s.heartbeat_interval, 30);
        assert_eq!(s.max_upload_size, 25 * 1024 * 1024);
        assert!(s.auto_download);
        assert!(!s.chatbot_enabled);
        assert_eq!(s.file_retention_days, 0);
    }

    #[test]
    fn allowlist_parses_csv() {
        let s = Settings {
            robot_http_allowlist: "api.example.com, internal.host ,".to_string(),
            ..Settings::default()
        };
        assert_eq!(s.http_allowlist(), vec!["api.example.com", "internal.host"]);
    }

    #[test]
    fn flag_accepts_shell_spellings() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "de_flag")]
            v: bool,
        }
        for (raw, want) in [
            (r#"{"v": "yes"}"#, true),
            (r#"{"v": "off"}"#, false),
            (r#"{"v": 1}"#, true),
            (r#"{"v": true}"#, true),
            (r#"{"v": "0"}"#, false),
        ] {
            let p: Probe = serde_json::from_str(raw).unwrap();
            assert_eq!(p.v, want, "input: {raw}");
        }
    }
}
