//! Background-task supervision: heartbeat/reconnect, periodic session
//! saves, retention sweeps, the trace flusher, and graceful shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use wxbridge_core::bounded::BoundedRing;
use wxbridge_engine::SyncStatus;

use crate::app::AppState;

/// How many errors the stability ring remembers.
const ERROR_RING_CAP: usize = 20;

const SESSION_SAVE_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Process stability bookkeeping: last errors and reconnect counting.
pub struct Stability {
    errors: Mutex<BoundedRing<Value>>,
    reconnect_attempts: AtomicU32,
    started: Instant,
}

impl Stability {
    pub fn new() -> Self {
        Self {
            errors: Mutex::new(BoundedRing::new(ERROR_RING_CAP)),
            reconnect_attempts: AtomicU32::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_error(&self, context: &str, message: &str) {
        self.errors.lock().unwrap().push(json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "context": context,
            "error": message,
        }));
    }

    pub fn errors(&self) -> Vec<Value> {
        self.errors.lock().unwrap().iter().cloned().collect()
    }

    /// Returns the attempt count after incrementing.
    pub fn bump_reconnects(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_reconnects(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for Stability {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every spawned background loop and the shared shutdown channel.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn the ingestion loop, scheduler, heartbeat, session saver,
    /// retention sweeper, and trace flusher.
    pub fn spawn_all(state: &Arc<AppState>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            state.engine.trace().run_flush_loop(shutdown_rx.clone()),
        ));

        let ingest = crate::ingest::IngestLoop::new(state.clone());
        handles.push(tokio::spawn(ingest.run(shutdown_rx.clone())));

        handles.push(tokio::spawn(
            state.scheduler.clone().run_loop(shutdown_rx.clone()),
        ));

        handles.push(tokio::spawn(heartbeat_loop(
            state.clone(),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(session_saver_loop(
            state.clone(),
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(retention_loop(state.clone(), shutdown_rx)));

        Self { shutdown_tx, handles }
    }

    /// Cancel everything, wait for completion, then run unload hooks and
    /// final persistence.
    pub async fn shutdown(self, state: &Arc<AppState>) {
        info!("shutting down background tasks");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("background task join failed: {e}");
            }
        }
        state.registry.run_unload_hooks().await;
        state.engine.shutdown().await;
        info!("shutdown complete");
    }
}

/// Heartbeat: synccheck every `HEARTBEAT_INTERVAL`; a `loginout` marks the
/// engine logged out and drives the reconnect protocol.
async fn heartbeat_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.settings.heartbeat_interval.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !state.engine.is_logged_in() {
                    continue;
                }
                if state.engine.synccheck().await == SyncStatus::LoginOut {
                    warn!("heartbeat observed loginout");
                    state.engine.mark_logged_out();
                    reconnect(&state).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("heartbeat loop stopped");
                    break;
                }
            }
        }
    }
}

/// One reconnect round: wait, reload the persisted session, re-probe.
/// Attempts past the configured maximum latch a single error and stop
/// retrying until a login succeeds elsewhere.
async fn reconnect(state: &Arc<AppState>) {
    let attempts = state.stability.bump_reconnects();
    let max = state.settings.max_reconnect_attempts;
    if attempts > max {
        if attempts == max + 1 {
            state.stability.record_error(
                "heartbeat",
                &format!("reconnect gave up after {max} attempts"),
            );
            error!("reconnect gave up after {max} attempts");
        }
        return;
    }

    info!(attempt = attempts, "reconnect attempt");
    tokio::time::sleep(Duration::from_secs(state.settings.reconnect_delay)).await;
    if let Err(e) = state.engine.load_session_from_disk() {
        warn!("session reload during reconnect failed: {e}");
    }
    if state.engine.check_login_status(true).await {
        info!("reconnect succeeded");
        state.stability.reset_reconnects();
    }
}

/// Persist the session every minute while logged in.
async fn session_saver_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SESSION_SAVE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if state.engine.is_logged_in() {
                    if let Err(e) = state.engine.save_session() {
                        state.stability.record_error("session-saver", &e.to_string());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Hourly retention sweep over downloaded files (rows and on-disk copies).
async fn retention_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let days = state.settings.file_retention_days;
                if days == 0 {
                    continue;
                }
                match state.store.cleanup_old_files(days, true) {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "retention sweep removed expired files"),
                    Err(e) => state.stability.record_error("retention", &e.to_string()),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
