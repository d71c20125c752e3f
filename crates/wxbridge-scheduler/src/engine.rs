//! Minute-granularity task execution with at-most-once-per-day gating.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::snapshot;
use crate::types::{valid_time_hm, ScheduledTask};

/// The loop wakes this often; fine enough for minute-level schedules.
pub const TICK_INTERVAL: Duration = Duration::from_secs(20);

/// Executes a fired task's command. The gateway implements this on top of
/// the dispatcher (chat fallback disabled) and sends any reply upstream.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &ScheduledTask, trigger: &str) -> Result<Option<String>>;
}

/// Owns the persisted task list and drives execution.
///
/// Shared handle: management calls (list/add/delete/toggle/run-now) may run
/// concurrently with the loop; the task vec sits behind a `Mutex` and the
/// snapshot file is rewritten whenever the list is dirty.
pub struct SchedulerHandle {
    path: PathBuf,
    tasks: Mutex<Vec<ScheduledTask>>,
    runner: Arc<dyn TaskRunner>,
}

impl SchedulerHandle {
    /// Load the snapshot (empty if the file is absent) and wrap it.
    pub fn load(path: PathBuf, runner: Arc<dyn TaskRunner>) -> Self {
        let tasks = snapshot::load(&path);
        info!(count = tasks.len(), path = %path.display(), "scheduled tasks loaded");
        Self {
            path,
            tasks: Mutex::new(tasks),
            runner,
        }
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().unwrap().clone()
    }

    /// Validate and append a task; rewrites the snapshot.
    pub fn add_task(&self, time_hm: &str, command: &str, description: &str) -> Result<ScheduledTask> {
        if !valid_time_hm(time_hm) {
            return Err(SchedulerError::InvalidTime(time_hm.to_string()));
        }
        if command.trim().is_empty() {
            return Err(SchedulerError::Execution("empty command".to_string()));
        }

        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            time_hm: time_hm.to_string(),
            command: command.to_string(),
            enabled: true,
            description: description.to_string(),
            last_run_date: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(task.clone());
        }
        self.save_snapshot();
        info!(task_id = %task.id, time_hm, "task added");
        Ok(task)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let removed = {
            let mut tasks = self.tasks.lock().unwrap();
            let before = tasks.len();
            tasks.retain(|t| t.id != id);
            tasks.len() < before
        };
        if !removed {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        self.save_snapshot();
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    pub fn toggle_task(&self, id: &str) -> Result<ScheduledTask> {
        let toggled = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.iter_mut().find(|t| t.id == id) {
                Some(task) => {
                    task.enabled = !task.enabled;
                    Some(task.clone())
                }
                None => None,
            }
        };
        let task = toggled.ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        self.save_snapshot();
        Ok(task)
    }

    /// Run a task immediately, bypassing the time gate. Does not touch
    /// `last_run_date`, so the automatic run for the day still happens.
    pub async fn run_task_now(&self, id: &str) -> Result<Option<String>> {
        let task = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        self.runner.run(&task, "manual").await
    }

    /// One scheduling pass for the given wall-clock instant. Runs each due
    /// task sequentially (awaited, so ticks never overlap themselves) and
    /// stamps `last_run_date` afterwards.
    pub async fn tick(&self, now: DateTime<Local>) {
        let hm = now.format("%H:%M").to_string();
        let today = now.format("%Y-%m-%d").to_string();

        let due: Vec<ScheduledTask> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .iter()
                .filter(|t| t.enabled && t.time_hm == hm && t.last_run_date.as_deref() != Some(today.as_str()))
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let mut dirty = false;
        for task in due {
            info!(task_id = %task.id, command = %task.command, "running scheduled task");
            if let Err(e) = self.runner.run(&task, "auto").await {
                error!(task_id = %task.id, "scheduled task failed: {e}");
            }
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(stored) = tasks.iter_mut().find(|t| t.id == task.id) {
                stored.last_run_date = Some(today.clone());
                dirty = true;
            }
        }
        if dirty {
            self.save_snapshot();
        }
    }

    /// Background loop: tick every [`TICK_INTERVAL`] until shutdown.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(Local::now()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler loop stopped");
                        break;
                    }
                }
            }
        }
    }

    fn save_snapshot(&self) {
        let tasks = self.tasks.lock().unwrap().clone();
        if let Err(e) = snapshot::save(&self.path, &tasks) {
            warn!(path = %self.path.display(), "task snapshot write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for CountingRunner {
        async fn run(&self, _task: &ScheduledTask, _trigger: &str) -> Result<Option<String>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(Some("done".to_string()))
        }
    }

    fn handle(dir: &std::path::Path) -> (Arc<SchedulerHandle>, Arc<CountingRunner>) {
        let runner = Arc::new(CountingRunner { runs: AtomicUsize::new(0) });
        let h = Arc::new(SchedulerHandle::load(
            dir.join("tasks.json"),
            runner.clone(),
        ));
        (h, runner)
    }

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn add_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (h, _) = handle(dir.path());

        let task = h.add_task("09:00", "/ping", "morning").unwrap();
        let listed = h.list_tasks();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].time_hm, "09:00");
        assert_eq!(listed[0].command, "/ping");

        // The snapshot on disk matches.
        let reloaded = snapshot::load(&dir.path().join("tasks.json"));
        assert_eq!(reloaded.len(), 1);

        h.delete_task(&task.id).unwrap();
        assert!(h.list_tasks().is_empty());
        assert!(matches!(
            h.delete_task(&task.id),
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn malformed_time_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (h, _) = handle(dir.path());
        assert!(matches!(
            h.add_task("25:99", "/ping", ""),
            Err(SchedulerError::InvalidTime(_))
        ));
    }

    #[tokio::test]
    async fn task_fires_at_most_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let (h, runner) = handle(dir.path());
        h.add_task("09:00", "/ping", "").unwrap();

        // Two ticks in the same minute: one run.
        h.tick(at(9, 0)).await;
        h.tick(at(9, 0)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        // Later minute that day: nothing.
        h.tick(at(9, 1)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        // The gate is persisted.
        let stored = &h.list_tasks()[0];
        assert_eq!(stored.last_run_date.as_deref(), Some("2026-03-14"));

        // Next calendar day, same minute: fires again.
        let next_day = Local.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap();
        h.tick(next_day).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_tasks_never_fire() {
        let dir = tempfile::tempdir().unwrap();
        let (h, runner) = handle(dir.path());
        let task = h.add_task("10:30", "/ping", "").unwrap();
        h.toggle_task(&task.id).unwrap();

        h.tick(at(10, 30)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        // Toggle back on and it fires.
        h.toggle_task(&task.id).unwrap();
        h.tick(at(10, 30)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_run_bypasses_gate_without_consuming_it() {
        let dir = tempfile::tempdir().unwrap();
        let (h, runner) = handle(dir.path());
        let task = h.add_task("09:00", "/ping", "").unwrap();

        let reply = h.run_task_now(&task.id).await.unwrap();
        assert_eq!(reply.as_deref(), Some("done"));
        assert!(h.list_tasks()[0].last_run_date.is_none());

        // The automatic run for the day still happens.
        h.tick(at(9, 0)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);

        assert!(h.run_task_now("missing").await.is_err());
    }
}
