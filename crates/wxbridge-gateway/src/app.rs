use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Query;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::services::ServeDir;
use tracing::warn;

use wxbridge_core::config::Settings;
use wxbridge_core::types::InboundMessage;
use wxbridge_engine::Engine;
use wxbridge_plugins::registry::PluginDeps;
use wxbridge_plugins::{Dispatcher, Registry, RouteDef};
use wxbridge_scheduler::{ScheduledTask, SchedulerHandle, TaskRunner};
use wxbridge_store::MessageStore;

use crate::supervisor::Stability;

/// Central shared state — passed as `Arc<AppState>` to every handler.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub engine: Arc<Engine>,
    pub store: Arc<MessageStore>,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<SchedulerHandle>,
    pub stability: Arc<Stability>,
    /// Handles re-published to plugins on `/plugins/reload`.
    pub plugin_deps: PluginDeps,
}

/// Scheduler → dispatcher bridge. Fired commands go through the normal
/// dispatch pipeline with chat fallback disabled; the tagged reply is sent
/// back upstream.
pub struct DispatchRunner {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<Engine>,
}

#[async_trait::async_trait]
impl TaskRunner for DispatchRunner {
    async fn run(
        &self,
        task: &ScheduledTask,
        trigger: &str,
    ) -> wxbridge_scheduler::Result<Option<String>> {
        let msg = InboundMessage::text(
            format!("task-{}-{}", task.id, chrono::Utc::now().timestamp_millis()),
            task.command.clone(),
            false,
        );
        let reply = self.dispatcher.dispatch(&msg, false).await;
        let Some(reply) = reply else {
            return Ok(None);
        };

        let tagged = format!("[task:{}:{}] {}", task.id, trigger, reply);
        if let Err(e) = self.engine.send_text(&tagged).await {
            warn!(task_id = %task.id, "scheduled reply send failed: {e}");
        }
        Ok(Some(tagged))
    }
}

/// Assemble the full router: core routes, plugin-contributed routes, and
/// the static mount over the download directory.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // service root + login surface
        .route("/", get(crate::http::wechat::root))
        .route("/qr", get(crate::http::wechat::qr))
        .route("/login/status", get(crate::http::wechat::login_status))
        .route("/send", post(crate::http::wechat::send))
        .route("/upload", post(crate::http::wechat::upload))
        .route("/messages", get(crate::http::wechat::messages))
        .route("/debug/state", get(crate::http::wechat::debug_state))
        .route("/wechat/session/save", post(crate::http::wechat::session_save))
        .route("/wechat/trace/status", get(crate::http::wechat::trace_status))
        .route("/wechat/trace/recent", get(crate::http::wechat::trace_recent))
        .route("/wechat/trace/clear", post(crate::http::wechat::trace_clear))
        // Telegram-Bot-API-compatible subset
        .route("/bot/getMe", get(crate::http::bot::get_me))
        .route("/bot/getUpdates", get(crate::http::bot::get_updates))
        .route("/bot/sendMessage", post(crate::http::bot::send_message))
        .route("/bot/sendDocument", post(crate::http::bot::send_document))
        .route("/bot/sendPhoto", post(crate::http::bot::send_photo))
        .route("/bot/getChat", get(crate::http::bot::get_chat))
        .route("/bot/setWebhook", post(crate::http::bot::set_webhook))
        .route("/bot/deleteWebhook", post(crate::http::bot::delete_webhook))
        .route("/bot/getWebhookInfo", get(crate::http::bot::get_webhook_info))
        .route("/bot/getFile", get(crate::http::bot::get_file))
        // message store
        .route("/store/stats", get(crate::http::store_api::stats))
        .route("/store/messages", get(crate::http::store_api::messages))
        .route("/downloads", get(crate::http::store_api::downloads))
        .route("/files/cleanup", post(crate::http::store_api::cleanup))
        // framework control
        .route("/framework/execute", post(crate::http::framework::execute))
        .route(
            "/framework/tasks",
            get(crate::http::framework::list_tasks).post(crate::http::framework::add_task),
        )
        .route("/framework/tasks/{id}", delete(crate::http::framework::delete_task))
        .route("/framework/tasks/{id}/run", post(crate::http::framework::run_task))
        .route(
            "/framework/tasks/{id}/toggle",
            post(crate::http::framework::toggle_task),
        )
        .route("/plugins", get(crate::http::framework::plugins_status))
        .route("/plugins/reload", post(crate::http::framework::plugins_reload))
        .route(
            "/chat-mode",
            get(crate::http::framework::chat_mode_get).post(crate::http::framework::chat_mode_set),
        )
        .route("/health", get(crate::http::framework::health))
        .route("/stability", get(crate::http::framework::stability));

    // Plugin-contributed routes, mounted after load.
    for route in state.registry.routes() {
        router = mount_plugin_route(router, &route);
    }

    router
        .nest_service("/static", ServeDir::new(&state.settings.download_dir))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Adapt a JSON-in/JSON-out plugin route onto the framework. GET feeds the
/// query string as params; anything else feeds the JSON body.
fn mount_plugin_route(router: Router<Arc<AppState>>, route: &RouteDef) -> Router<Arc<AppState>> {
    let handler = route.handler.clone();
    let name = route.name.clone();

    match route.method.to_ascii_uppercase().as_str() {
        "GET" => router.route(
            &route.path,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let handler = handler.clone();
                async move { run_plugin_route(handler, json!(params)).await }
            }),
        ),
        "POST" => router.route(
            &route.path,
            post(move |body: String| {
                let handler = handler.clone();
                async move {
                    let params = serde_json::from_str(&body).unwrap_or(Value::Null);
                    run_plugin_route(handler, params).await
                }
            }),
        ),
        other => {
            warn!(method = other, route = %name, "unsupported plugin route method");
            router
        }
    }
}

async fn run_plugin_route(
    handler: Arc<dyn wxbridge_plugins::RouteHandler>,
    params: Value,
) -> Json<Value> {
    match handler.handle(params).await {
        Ok(result) => Json(result),
        Err(e) => Json(json!({ "error": e.to_string() })),
    }
}
