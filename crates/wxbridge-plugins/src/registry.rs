use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use wxbridge_core::config::Settings;
use wxbridge_engine::Engine;
use wxbridge_store::MessageStore;

use crate::types::{Command, LifecycleHook, MessageHandler, RouteDef};

/// Process-wide handles published to plugins at load time.
#[derive(Clone)]
pub struct PluginDeps {
    pub engine: Arc<Engine>,
    pub store: Arc<MessageStore>,
    pub settings: Arc<Settings>,
}

/// One compile-time plugin: a name and its registration entry point.
///
/// The loader runs entries in alphabetical name order; a failing entry is
/// captured per plugin and never aborts the load.
pub struct PluginDef {
    pub name: &'static str,
    pub register: fn(&Registry, &PluginDeps) -> std::result::Result<(), String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginLoadError {
    pub plugin: String,
    pub error: String,
}

/// In-memory tables of commands, prioritized handlers, lifecycle hooks, and
/// HTTP routes. Mutated only during load/reload; read concurrently after.
pub struct Registry {
    /// Keyed by lowercase name and every lowercase alias.
    commands: DashMap<String, Arc<Command>>,
    handlers: RwLock<Vec<MessageHandler>>,
    /// Set on insert; the handler list is lazily re-sorted on first read.
    handlers_dirty: AtomicBool,
    routes: RwLock<Vec<RouteDef>>,
    on_load: RwLock<Vec<Arc<dyn LifecycleHook>>>,
    on_unload: RwLock<Vec<Arc<dyn LifecycleHook>>>,
    loaded: RwLock<Vec<String>>,
    errors: RwLock<Vec<PluginLoadError>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            commands: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            handlers_dirty: AtomicBool::new(false),
            routes: RwLock::new(Vec::new()),
            on_load: RwLock::new(Vec::new()),
            on_unload: RwLock::new(Vec::new()),
            loaded: RwLock::new(Vec::new()),
            errors: RwLock::new(Vec::new()),
        }
    }

    // --- registration (called from plugin register fns) ---------------------

    pub fn register_command(&self, command: Command) {
        let command = Arc::new(Command {
            name: command.name.to_lowercase(),
            aliases: command.aliases.iter().map(|a| a.to_lowercase()).collect(),
            ..command
        });
        for key in std::iter::once(&command.name).chain(command.aliases.iter()) {
            self.commands.insert(key.clone(), command.clone());
        }
        debug!(name = %command.name, "command registered");
    }

    pub fn register_handler(&self, handler: MessageHandler) {
        self.handlers.write().unwrap().push(handler);
        self.handlers_dirty.store(true, Ordering::Release);
    }

    pub fn register_route(&self, route: RouteDef) {
        debug!(method = %route.method, path = %route.path, "route registered");
        self.routes.write().unwrap().push(route);
    }

    pub fn on_load(&self, hook: Arc<dyn LifecycleHook>) {
        self.on_load.write().unwrap().push(hook);
    }

    pub fn on_unload(&self, hook: Arc<dyn LifecycleHook>) {
        self.on_unload.write().unwrap().push(hook);
    }

    // --- lookups ------------------------------------------------------------

    /// Case-insensitive command lookup by name or alias.
    pub fn find_command(&self, name: &str) -> Option<Arc<Command>> {
        self.commands.get(&name.to_lowercase()).map(|e| e.value().clone())
    }

    /// Handlers in descending priority order. Re-sorts lazily after inserts;
    /// ties keep registration order.
    pub fn handlers_by_priority(&self) -> Vec<MessageHandler> {
        if self.handlers_dirty.swap(false, Ordering::AcqRel) {
            let mut handlers = self.handlers.write().unwrap();
            handlers.sort_by_key(|h| std::cmp::Reverse(h.priority));
        }
        self.handlers.read().unwrap().clone()
    }

    pub fn routes(&self) -> Vec<RouteDef> {
        self.routes.read().unwrap().clone()
    }

    /// Primary (non-alias) commands, hidden ones excluded, sorted by name.
    pub fn visible_commands(&self) -> Vec<Arc<Command>> {
        let mut seen = std::collections::HashSet::new();
        let mut out: Vec<Arc<Command>> = self
            .commands
            .iter()
            .filter(|e| *e.key() == e.value().name && !e.value().hidden)
            .filter(|e| seen.insert(e.value().name.clone()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // --- load / reload ------------------------------------------------------

    /// Run every plugin's registration entry in alphabetical order. A
    /// failing plugin is captured in the error list and skipped.
    pub fn load(&self, plugins: &[PluginDef], deps: &PluginDeps) {
        let mut ordered: Vec<&PluginDef> = plugins.iter().collect();
        ordered.sort_by_key(|p| p.name);

        for plugin in ordered {
            match (plugin.register)(self, deps) {
                Ok(()) => {
                    info!(plugin = plugin.name, "plugin loaded");
                    self.loaded.write().unwrap().push(plugin.name.to_string());
                }
                Err(e) => {
                    error!(plugin = plugin.name, "plugin load failed: {e}");
                    self.errors.write().unwrap().push(PluginLoadError {
                        plugin: plugin.name.to_string(),
                        error: e,
                    });
                }
            }
        }
    }

    /// Clear every table and re-run the load.
    pub fn reload(&self, plugins: &[PluginDef], deps: &PluginDeps) {
        self.commands.clear();
        self.handlers.write().unwrap().clear();
        self.handlers_dirty.store(false, Ordering::Release);
        self.routes.write().unwrap().clear();
        self.on_load.write().unwrap().clear();
        self.on_unload.write().unwrap().clear();
        self.loaded.write().unwrap().clear();
        self.errors.write().unwrap().clear();
        self.load(plugins, deps);
    }

    /// Run `on_load` hooks sequentially; errors are logged, not propagated.
    pub async fn run_load_hooks(&self) {
        let hooks: Vec<_> = self.on_load.read().unwrap().clone();
        for hook in hooks {
            if let Err(e) = hook.run().await {
                error!("on_load hook failed: {e}");
            }
        }
    }

    /// Run `on_unload` hooks sequentially at shutdown.
    pub async fn run_unload_hooks(&self) {
        let hooks: Vec<_> = self.on_unload.read().unwrap().clone();
        for hook in hooks {
            if let Err(e) = hook.run().await {
                error!("on_unload hook failed: {e}");
            }
        }
    }

    /// Status surface behind `GET /plugins`.
    pub fn status(&self) -> Value {
        let loaded = self.loaded.read().unwrap().clone();
        let errors = self.errors.read().unwrap().clone();
        let commands = self.visible_commands().len();
        json!({
            "loaded_count": loaded.len(),
            "loaded_plugins": loaded,
            "errors": errors,
            "commands_count": commands,
            "handlers_count": self.handlers.read().unwrap().len(),
            "routes_count": self.routes.read().unwrap().len(),
        })
    }

    pub fn load_errors(&self) -> Vec<PluginLoadError> {
        self.errors.read().unwrap().clone()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandContext, CommandHandler, MessageHook};
    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl CommandHandler for Nop {
        async fn handle(&self, _ctx: &CommandContext) -> crate::error::Result<String> {
            Ok("ok".to_string())
        }
    }

    #[async_trait]
    impl MessageHook for Nop {
        async fn handle(&self, _ctx: &CommandContext) -> crate::error::Result<Option<String>> {
            Ok(None)
        }
    }

    fn command(name: &str, aliases: &[&str], hidden: bool) -> Command {
        Command {
            name: name.to_string(),
            description: String::new(),
            usage: String::new(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            hidden,
            handler: Arc::new(Nop),
        }
    }

    #[test]
    fn command_lookup_is_case_insensitive_and_alias_aware() {
        let r = Registry::new();
        r.register_command(command("Ping", &["P", "pong-check"], false));
        assert!(r.find_command("ping").is_some());
        assert!(r.find_command("PING").is_some());
        assert!(r.find_command("p").is_some());
        assert!(r.find_command("Pong-Check").is_some());
        assert!(r.find_command("nope").is_none());
    }

    #[test]
    fn visible_commands_skip_hidden_and_aliases() {
        let r = Registry::new();
        r.register_command(command("b", &["beta"], false));
        r.register_command(command("a", &[], false));
        r.register_command(command("secret", &[], true));
        let visible = r.visible_commands();
        let names: Vec<&str> = visible.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn handlers_sort_by_priority_descending() {
        let r = Registry::new();
        for (name, priority) in [("low", 1), ("high", 50), ("mid", 10)] {
            r.register_handler(MessageHandler {
                name: name.to_string(),
                priority,
                handler: Arc::new(Nop),
            });
        }
        let order: Vec<String> = r
            .handlers_by_priority()
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn failing_plugin_is_captured_without_aborting_load() {
        fn good(r: &Registry, _d: &PluginDeps) -> std::result::Result<(), String> {
            r.register_command(Command {
                name: "good".into(),
                description: String::new(),
                usage: String::new(),
                aliases: vec![],
                hidden: false,
                handler: Arc::new(Nop),
            });
            Ok(())
        }
        fn bad(_r: &Registry, _d: &PluginDeps) -> std::result::Result<(), String> {
            Err("boom".to_string())
        }

        let r = Registry::new();
        let deps = test_deps();
        r.load(
            &[
                PluginDef { name: "zz-bad", register: bad },
                PluginDef { name: "aa-good", register: good },
            ],
            &deps,
        );

        assert!(r.find_command("good").is_some());
        let errors = r.load_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].plugin, "zz-bad");
        assert_eq!(errors[0].error, "boom");
        let status = r.status();
        assert_eq!(status["loaded_count"], 1);
    }

    #[test]
    fn reload_clears_previous_registrations() {
        fn one(r: &Registry, _d: &PluginDeps) -> std::result::Result<(), String> {
            r.register_command(Command {
                name: "one".into(),
                description: String::new(),
                usage: String::new(),
                aliases: vec![],
                hidden: false,
                handler: Arc::new(Nop),
            });
            Ok(())
        }

        let r = Registry::new();
        let deps = test_deps();
        r.load(&[PluginDef { name: "p", register: one }], &deps);
        assert!(r.find_command("one").is_some());

        r.reload(&[], &deps);
        assert!(r.find_command("one").is_none());
        assert_eq!(r.status()["loaded_count"], 0);
    }

    fn test_deps() -> PluginDeps {
        let settings = Arc::new(Settings::default());
        let engine = Arc::new(
            Engine::new(wxbridge_engine::engine::EngineOptions {
                entry_host: settings.wechat_entry_host.clone(),
                state_path: std::env::temp_dir().join("wxbridge-registry-test-state.json"),
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
}
