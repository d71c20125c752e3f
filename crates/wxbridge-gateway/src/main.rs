use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use wxbridge_core::config::Settings;
use wxbridge_engine::engine::EngineOptions;
use wxbridge_engine::Engine;
use wxbridge_plugins::registry::PluginDeps;
use wxbridge_plugins::{builtin, Dispatcher, Registry};
use wxbridge_scheduler::SchedulerHandle;
use wxbridge_store::MessageStore;

use wxbridge_gateway::app::{build_router, AppState, DispatchRunner};
use wxbridge_gateway::supervisor::{BackgroundTasks, Stability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxbridge=info,wxbridge_gateway=info,tower_http=info".into()),
        )
        .init();

    let settings = Arc::new(Settings::load().unwrap_or_else(|e| {
        warn!("settings load failed ({e}), using defaults");
        Settings::default()
    }));
    settings.ensure_dirs()?;

    let store = Arc::new(MessageStore::open(&settings.message_db_path)?);
    let engine = Arc::new(Engine::new(EngineOptions::from_settings(&settings))?);

    let registry = Arc::new(Registry::new());
    let plugin_deps = PluginDeps {
        engine: engine.clone(),
        store: store.clone(),
        settings: settings.clone(),
    };
    registry.load(builtin::plugins(), &plugin_deps);

    let dispatcher = Dispatcher::new(
        registry.clone(),
        engine.clone(),
        store.clone(),
        settings.clone(),
    );
    let runner = Arc::new(DispatchRunner {
        dispatcher: dispatcher.clone(),
        engine: engine.clone(),
    });
    let scheduler = Arc::new(SchedulerHandle::load(
        settings.robot_task_file.clone(),
        runner,
    ));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        engine: engine.clone(),
        store,
        registry: registry.clone(),
        dispatcher,
        scheduler,
        stability: Arc::new(Stability::new()),
        plugin_deps,
    });

    // Restore the persisted session and probe the cached credentials
    // before traffic arrives.
    let restored = engine.bootstrap().await;
    info!(logged_in = restored, "engine bootstrapped");
    registry.run_load_hooks().await;

    let tasks = BackgroundTasks::spawn_all(&state);
    let router = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", settings.http_host, settings.http_port).parse()?;
    info!("wxbridge listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.shutdown(&state).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("shutdown signal listener failed: {e}");
    }
}
