//! Message dispatch: persist → webhook push → handler chain → command
//! lookup → chat-mode fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use wxbridge_core::config::Settings;
use wxbridge_core::types::{InboundMessage, MsgKind};
use wxbridge_engine::Engine;
use wxbridge_store::types::NewMessage;
use wxbridge_store::MessageStore;

use crate::registry::Registry;
use crate::types::CommandContext;

/// Reply used when chat mode is on but no chat backend is configured.
const CANNED_CHAT_REPLY: &str = "Chat mode is on, but no chat backend is configured.";

/// Routes normalized messages through the plugin chain.
///
/// Holds the two dispatcher-scoped toggles: the chat-mode flag and the
/// runtime webhook URL (seeded from `MESSAGE_WEBHOOK_URL`, mutable via
/// `setWebhook`/`deleteWebhook`).
pub struct Dispatcher {
    registry: Arc<Registry>,
    engine: Arc<Engine>,
    store: Arc<MessageStore>,
    settings: Arc<Settings>,
    http: reqwest::Client,
    chat_mode: AtomicBool,
    webhook_url: RwLock<Option<String>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<Engine>,
        store: Arc<MessageStore>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        let webhook_url = if settings.message_webhook_url.is_empty() {
            None
        } else {
            Some(settings.message_webhook_url.clone())
        };
        Arc::new(Self {
            registry,
            engine,
            store,
            chat_mode: AtomicBool::new(settings.chatbot_enabled),
            webhook_url: RwLock::new(webhook_url),
            http: reqwest::Client::new(),
            settings,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn chat_mode(&self) -> bool {
        self.chat_mode.load(Ordering::Relaxed)
    }

    pub fn set_chat_mode(&self, enabled: bool) {
        self.chat_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn set_webhook(&self, url: &str) {
        let mut slot = self.webhook_url.write().unwrap();
        *slot = if url.is_empty() { None } else { Some(url.to_string()) };
    }

    pub fn delete_webhook(&self) {
        *self.webhook_url.write().unwrap() = None;
    }

    pub fn webhook_info(&self) -> Value {
        json!({
            "url": self.webhook_url.read().unwrap().clone().unwrap_or_default(),
            "has_custom_certificate": false,
            "pending_update_count": 0,
        })
    }

    /// Route one message. Returns the reply to send back, if any.
    pub async fn dispatch(
        self: &Arc<Self>,
        msg: &InboundMessage,
        allow_chat: bool,
    ) -> Option<String> {
        // Self-echo suppression: never re-dispatch our own sends.
        if self.engine.is_self_sent(&msg.id) {
            debug!(msg_id = %msg.id, "skipping self-sent echo");
            return None;
        }

        // 1. Persist (best-effort).
        let update_id = match self.store.save_message(NewMessage {
            msg_id: msg.id.clone(),
            kind: msg.kind.as_str().to_string(),
            text: msg.text.clone(),
            is_mine: msg.is_mine,
            file_name: msg.file_name.clone(),
            file_path: msg.file_path.clone(),
            file_size: msg.file_size.map(|s| s as i64),
            reply_to_id: msg.reply_to.clone(),
            ..NewMessage::default()
        }) {
            Ok(id) => id,
            Err(e) => {
                warn!(msg_id = %msg.id, "message persist failed: {e}");
                0
            }
        };

        // 2. Webhook push (before command dispatch, errors logged only).
        self.push_webhook(update_id, msg).await;

        // 3. Nothing further to do for empty text.
        let text = msg.text.trim().to_string();
        if text.is_empty() {
            return None;
        }

        // 4. Parse: strip leading '/', split, lowercase the command.
        let is_command = text.starts_with('/');
        let stripped = text.strip_prefix('/').unwrap_or(&text);
        let mut parts = stripped.split_whitespace();
        let command = parts.next().unwrap_or("").to_lowercase();
        let args: Vec<String> = parts.map(|s| s.to_string()).collect();

        // 5. Typed context.
        let ctx = CommandContext {
            raw_text: text.clone(),
            command: command.clone(),
            args,
            message: msg.clone(),
            msg_id: msg.id.clone(),
            is_command,
            reply_to: msg.reply_to.clone(),
            engine: self.engine.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            dispatcher: self.clone(),
            extras: HashMap::new(),
        };

        // 6. Handler chain: first non-empty reply wins.
        for handler in self.registry.handlers_by_priority() {
            match handler.handler.handle(&ctx).await {
                Ok(Some(reply)) if !reply.is_empty() => {
                    debug!(handler = %handler.name, "handler replied");
                    return Some(reply);
                }
                Ok(_) => {}
                Err(e) => warn!(handler = %handler.name, "handler failed: {e}"),
            }
        }

        // 7. Command lookup.
        if let Some(cmd) = self.registry.find_command(&command) {
            match cmd.handler.handle(&ctx).await {
                Ok(reply) if !reply.is_empty() => return Some(reply),
                Ok(_) => return None,
                Err(e) => {
                    warn!(command = %cmd.name, "command failed: {e}");
                    return None;
                }
            }
        }

        // 8. Chat-mode fallback.
        if allow_chat && self.chat_mode() {
            return self.chat_reply(&text).await;
        }
        None
    }

    /// POST the TG-shaped envelope to the configured webhook.
    async fn push_webhook(&self, update_id: i64, msg: &InboundMessage) {
        let url = match self.webhook_url.read().unwrap().clone() {
            Some(url) => url,
            None => return,
        };

        let mut message = json!({
            "message_id": msg.id,
            "date": chrono::Utc::now().timestamp(),
            "text": msg.text,
            "type": msg.kind.as_str(),
        });
        if msg.kind == MsgKind::File || msg.kind == MsgKind::Image {
            message["document"] = json!({
                "file_name": msg.file_name,
                "file_size": msg.file_size,
            });
        }
        let envelope = json!({ "update_id": update_id, "message": message });

        let timeout = Duration::from_secs(self.settings.message_webhook_timeout);
        match self.http.post(&url).timeout(timeout).json(&envelope).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "webhook push rejected");
            }
            Ok(_) => {}
            Err(e) => warn!("webhook push failed: {e}"),
        }
    }

    /// Chat backend: webhook when configured, canned response otherwise.
    async fn chat_reply(&self, text: &str) -> Option<String> {
        let url = self.settings.chatbot_webhook_url.clone();
        if url.is_empty() {
            return Some(CANNED_CHAT_REPLY.to_string());
        }

        let payload = json!({
            "message": text,
            "from": "filehelper",
            "timestamp": chrono::Utc::now().timestamp(),
            "server": self.settings.server_label(),
        });
        let timeout = Duration::from_secs(self.settings.chatbot_timeout);
        let resp = match self.http.post(&url).timeout(timeout).json(&payload).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("chat backend unreachable: {e}");
                return None;
            }
        };
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!("chat backend read failed: {e}");
                return None;
            }
        };

        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            for key in ["reply", "content", "text", "message"] {
                if let Some(reply) = parsed[key].as_str() {
                    if !reply.is_empty() {
                        return Some(reply.to_string());
                    }
                }
            }
        }
        let trimmed = body.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::registry::PluginDeps;
    use crate::types::{MessageHandler, MessageHook};
    use async_trait::async_trait;

    fn deps() -> PluginDeps {
        let settings = Arc::new(Settings::default());
        let engine = Arc::new(
            Engine::new(wxbridge_engine::engine::EngineOptions {
                entry_host: settings.wechat_entry_host.clone(),
                state_path: std::env::temp_dir().join("wxbridge-dispatch-test-state.json"),
                max_upload_size: settings.max_upload_size,
                login_callback_url: String::new(),
                trace: wxbridge_engine::trace::TraceOptions {
                    enabled: false,
                    redact: true,
                    max_body: 4096,
                    dir: std::env::temp_dir(),
                },
            })
            .unwrap(),
        );
        let store = Arc::new(
            MessageStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap(),
        );
        PluginDeps { engine, store, settings }
    }

    fn dispatcher_with_builtins(deps: &PluginDeps) -> Arc<Dispatcher> {
        let registry = Arc::new(Registry::new());
        registry.load(builtin::plugins(), deps);
        Dispatcher::new(
            registry,
            deps.engine.clone(),
            deps.store.clone(),
            deps.settings.clone(),
        )
    }

    #[tokio::test]
    async fn slash_ping_returns_pong() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("1", "/ping", false);
        assert_eq!(d.dispatch(&msg, true).await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn bare_ping_works_too() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("2", "PING", false);
        assert_eq!(d.dispatch(&msg, true).await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn dispatch_persists_to_store() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("42", "/ping", false);
        d.dispatch(&msg, true).await;
        let stored = deps.store.get_message("42").unwrap().unwrap();
        assert_eq!(stored.text, "/ping");
        assert!(!stored.is_mine);
    }

    #[tokio::test]
    async fn empty_text_short_circuits() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("3", "   ", false);
        assert!(d.dispatch(&msg, true).await.is_none());
    }

    #[tokio::test]
    async fn unknown_command_without_chat_mode_is_silent() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("4", "/definitely-not-a-command", false);
        assert!(d.dispatch(&msg, true).await.is_none());
    }

    #[tokio::test]
    async fn chat_mode_without_backend_returns_canned_reply() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        d.set_chat_mode(true);
        let msg = InboundMessage::text("5", "hello there", false);
        assert_eq!(
            d.dispatch(&msg, true).await.as_deref(),
            Some(CANNED_CHAT_REPLY)
        );
        // Chat fallback disabled callers never reach the chat backend.
        let msg2 = InboundMessage::text("6", "hello again", false);
        assert!(d.dispatch(&msg2, false).await.is_none());
    }

    #[tokio::test]
    async fn chat_mode_toggle_round_trips() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let initial = d.chat_mode();
        d.set_chat_mode(true);
        assert!(d.chat_mode());
        d.set_chat_mode(false);
        assert!(!d.chat_mode());
        d.set_chat_mode(initial);
        assert_eq!(d.chat_mode(), initial);
    }

    #[tokio::test]
    async fn health_probe_short_circuits_before_commands() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("7", "#PING#", false);
        assert_eq!(d.dispatch(&msg, true).await.as_deref(), Some("Pong!"));
    }

    #[tokio::test]
    async fn higher_priority_handler_wins() {
        struct Always(&'static str);

        #[async_trait]
        impl MessageHook for Always {
            async fn handle(&self, _ctx: &CommandContext) -> crate::error::Result<Option<String>> {
                Ok(Some(self.0.to_string()))
            }
        }

        let deps = deps();
        let registry = Arc::new(Registry::new());
        registry.register_handler(MessageHandler {
            name: "low".into(),
            priority: 1,
            handler: Arc::new(Always("low")),
        });
        registry.register_handler(MessageHandler {
            name: "high".into(),
            priority: 99,
            handler: Arc::new(Always("high")),
        });
        let d = Dispatcher::new(
            registry,
            deps.engine.clone(),
            deps.store.clone(),
            deps.settings.clone(),
        );
        let msg = InboundMessage::text("8", "anything", false);
        assert_eq!(d.dispatch(&msg, true).await.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn webhook_url_set_and_delete_round_trip() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        assert_eq!(d.webhook_info()["url"], "");
        d.set_webhook("http://127.0.0.1:1/hook");
        assert_eq!(d.webhook_info()["url"], "http://127.0.0.1:1/hook");
        d.delete_webhook();
        assert_eq!(d.webhook_info()["url"], "");
        assert_eq!(d.webhook_info()["pending_update_count"], 0);
    }

    #[tokio::test]
    async fn fetch_refuses_unlisted_hosts_offline() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("11", "/fetch https://example.com/x", false);
        let reply = d.dispatch(&msg, true).await.unwrap();
        assert_eq!(reply, "Fetch not allowed for host: example.com");

        let usage = InboundMessage::text("12", "/fetch", false);
        assert_eq!(
            d.dispatch(&usage, true).await.as_deref(),
            Some("Usage: /fetch <url>")
        );
    }

    #[tokio::test]
    async fn help_lists_builtin_commands() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("9", "/help", false);
        let reply = d.dispatch(&msg, true).await.unwrap();
        assert!(reply.contains("/ping"));
        assert!(reply.contains("/echo"));
    }

    #[tokio::test]
    async fn echo_returns_arguments() {
        let deps = deps();
        let d = dispatcher_with_builtins(&deps);
        let msg = InboundMessage::text("10", "/echo hello   world", false);
        assert_eq!(d.dispatch(&msg, true).await.as_deref(), Some("hello world"));
    }
}
