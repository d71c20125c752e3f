//! Plugin registry and message dispatcher.
//!
//! Plugins are linked into the binary and self-register through the
//! compile-time init list in [`builtin`]; the registry keeps the same
//! load-status surface a directory loader would (loaded names, captured
//! per-plugin errors) so `/plugins` keeps its contract.

pub mod builtin;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod types;

pub use dispatcher::Dispatcher;
pub use error::{PluginError, Result};
pub use registry::{PluginDef, PluginDeps, Registry};
pub use types::{
    Command, CommandContext, CommandHandler, LifecycleHook, MessageHandler, MessageHook, RouteDef,
    RouteHandler,
};
