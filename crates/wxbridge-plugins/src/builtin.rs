//! Builtin plugins linked into the binary.
//!
//! This is the compile-time init list the registry loads at boot, the
//! Rust counterpart of dropping files into the plugins directory.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::registry::{PluginDeps, Registry};
use crate::types::{
    Command, CommandContext, CommandHandler, LifecycleHook, MessageHandler, MessageHook, RouteDef,
    RouteHandler,
};

/// All plugins compiled into this binary, loaded in alphabetical order.
pub fn plugins() -> &'static [crate::registry::PluginDef] {
    use crate::registry::PluginDef;
    &[
        PluginDef { name: "builtin", register: register_builtin },
        PluginDef { name: "health-probe", register: register_health_probe },
    ]
}

fn register_builtin(registry: &Registry, deps: &PluginDeps) -> std::result::Result<(), String> {
    registry.register_command(Command {
        name: "ping".into(),
        description: "Connectivity check".into(),
        usage: "/ping".into(),
        aliases: vec![],
        hidden: false,
        handler: Arc::new(Ping),
    });
    registry.register_command(Command {
        name: "help".into(),
        description: "List available commands".into(),
        usage: "/help".into(),
        aliases: vec!["h".into()],
        hidden: false,
        handler: Arc::new(Help),
    });
    registry.register_command(Command {
        name: "echo".into(),
        description: "Echo the arguments back".into(),
        usage: "/echo <text>".into(),
        aliases: vec![],
        hidden: false,
        handler: Arc::new(Echo),
    });
    registry.register_command(Command {
        name: "time".into(),
        description: "Current server time".into(),
        usage: "/time".into(),
        aliases: vec![],
        hidden: false,
        handler: Arc::new(TimeCmd),
    });
    registry.register_command(Command {
        name: "status".into(),
        description: "Bridge status summary".into(),
        usage: "/status".into(),
        aliases: vec![],
        hidden: false,
        handler: Arc::new(Status),
    });
    registry.register_command(Command {
        name: "fetch".into(),
        description: "HTTP GET an allowlisted URL".into(),
        usage: "/fetch <url>".into(),
        aliases: vec![],
        hidden: false,
        handler: Arc::new(Fetch {
            client: reqwest::Client::new(),
            allowlist: deps.settings.http_allowlist(),
        }),
    });

    registry.register_route(RouteDef {
        method: "GET".into(),
        path: "/plugin/builtin/info".into(),
        name: "builtin-info".into(),
        tags: vec!["Plugins".into()],
        handler: Arc::new(InfoRoute {
            engine: deps.engine.clone(),
            store: deps.store.clone(),
        }),
    });

    registry.on_load(Arc::new(LogReady));
    Ok(())
}

fn register_health_probe(registry: &Registry, _deps: &PluginDeps) -> std::result::Result<(), String> {
    registry.register_handler(MessageHandler {
        name: "health-probe".into(),
        priority: 100,
        handler: Arc::new(HealthProbe),
    });
    Ok(())
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn handle(&self, _ctx: &CommandContext) -> Result<String> {
        Ok("pong".to_string())
    }
}

struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn handle(&self, ctx: &CommandContext) -> Result<String> {
        let commands = ctx.dispatcher.registry().visible_commands();
        let mut lines = vec!["Available commands:".to_string()];
        for cmd in commands {
            lines.push(format!("/{} - {}", cmd.name, cmd.description));
        }
        Ok(lines.join("\n"))
    }
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    async fn handle(&self, ctx: &CommandContext) -> Result<String> {
        Ok(ctx.args.join(" "))
    }
}

struct TimeCmd;

#[async_trait]
impl CommandHandler for TimeCmd {
    async fn handle(&self, _ctx: &CommandContext) -> Result<String> {
        Ok(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

struct Status;

#[async_trait]
impl CommandHandler for Status {
    async fn handle(&self, ctx: &CommandContext) -> Result<String> {
        let stats = ctx.store.get_stats()?;
        Ok(format!(
            "server: {}\nlogged_in: {}\nentry_host: {}\nchat_mode: {}\nmessages: {}\nfiles: {}",
            ctx.settings.server_label(),
            ctx.engine.is_logged_in(),
            ctx.engine.entry_host(),
            ctx.dispatcher.chat_mode(),
            stats.message_count,
            stats.file_count,
        ))
    }
}

/// Outbound HTTP-GET helper. Only hosts named in `ROBOT_HTTP_ALLOWLIST`
/// may be fetched; an empty allowlist denies everything.
struct Fetch {
    client: reqwest::Client,
    allowlist: Vec<String>,
}

/// How much of a fetched body is relayed into the chat.
const FETCH_PREVIEW_CHARS: usize = 500;

#[async_trait]
impl CommandHandler for Fetch {
    async fn handle(&self, ctx: &CommandContext) -> Result<String> {
        let Some(raw_url) = ctx.args.first() else {
            return Ok("Usage: /fetch <url>".to_string());
        };
        let url: reqwest::Url = raw_url
            .parse()
            .map_err(|e| crate::error::PluginError::Handler(format!("bad url: {e}")))?;
        let host = url.host_str().unwrap_or_default();
        if !self.allowlist.iter().any(|allowed| allowed == host) {
            return Ok(format!("Fetch not allowed for host: {host}"));
        }

        let resp = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| crate::error::PluginError::Handler(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| crate::error::PluginError::Handler(e.to_string()))?;
        let preview: String = body.chars().take(FETCH_PREVIEW_CHARS).collect();
        Ok(format!("[{status}] {preview}"))
    }
}

/// `#ping#` health probe: answers before any command parsing happens.
struct HealthProbe;

#[async_trait]
impl MessageHook for HealthProbe {
    async fn handle(&self, ctx: &CommandContext) -> Result<Option<String>> {
        if ctx.raw_text.eq_ignore_ascii_case("#ping#") {
            return Ok(Some("Pong!".to_string()));
        }
        Ok(None)
    }
}

struct InfoRoute {
    engine: Arc<wxbridge_engine::Engine>,
    store: Arc<wxbridge_store::MessageStore>,
}

#[async_trait]
impl RouteHandler for InfoRoute {
    async fn handle(&self, _params: Value) -> Result<Value> {
        let stats = self.store.get_stats()?;
        Ok(json!({
            "plugin": "builtin",
            "engine": self.engine.state_snapshot(),
            "message_count": stats.message_count,
        }))
    }
}

struct LogReady;

#[async_trait]
impl LifecycleHook for LogReady {
    async fn run(&self) -> Result<()> {
        info!("builtin plugin ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_list_is_alphabetical_by_name() {
        let names: Vec<&str> = plugins().iter().map(|p| p.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
