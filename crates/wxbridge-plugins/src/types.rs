use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use wxbridge_core::config::Settings;
use wxbridge_core::types::InboundMessage;
use wxbridge_engine::Engine;
use wxbridge_store::MessageStore;

use crate::error::Result;

/// Typed context handed to commands and message handlers.
pub struct CommandContext {
    /// Original message text, untrimmed of arguments.
    pub raw_text: String,
    /// Lowercased first token (leading `/` stripped).
    pub command: String,
    pub args: Vec<String>,
    pub message: InboundMessage,
    pub msg_id: String,
    /// True when the text began with `/`.
    pub is_command: bool,
    pub reply_to: Option<String>,
    pub engine: Arc<Engine>,
    pub store: Arc<MessageStore>,
    pub settings: Arc<Settings>,
    pub dispatcher: Arc<crate::dispatcher::Dispatcher>,
    /// Free-form extension data for plugins that need to pass state along.
    pub extras: HashMap<String, Value>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command; the returned string is sent back to the chat.
    async fn handle(&self, ctx: &CommandContext) -> Result<String>;
}

/// A message-chain handler. Returning `Some(reply)` short-circuits the rest
/// of the chain and the command lookup.
#[async_trait]
pub trait MessageHook: Send + Sync {
    async fn handle(&self, ctx: &CommandContext) -> Result<Option<String>>;
}

/// Lifecycle hook run sequentially at boot (`on_load`) or shutdown
/// (`on_unload`).
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// A registered command. `name` and every alias are lowercase; lookups are
/// case-insensitive.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub aliases: Vec<String>,
    pub hidden: bool,
    pub handler: Arc<dyn CommandHandler>,
}

#[derive(Clone)]
pub struct MessageHandler {
    pub name: String,
    /// Handlers run in descending priority order.
    pub priority: i32,
    pub handler: Arc<dyn MessageHook>,
}

/// Metadata for a plugin-contributed HTTP route; the gateway mounts these
/// during boot, after plugin load.
#[derive(Clone)]
pub struct RouteDef {
    pub method: String,
    pub path: String,
    pub name: String,
    pub tags: Vec<String>,
    pub handler: Arc<dyn RouteHandler>,
}

/// Plugin route handlers speak JSON-in/JSON-out; the gateway adapts them
/// onto the HTTP framework.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value>;
}
