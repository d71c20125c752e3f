//! Task list persistence: a plain JSON array, rewritten whenever the task
//! list is dirty.

use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::types::ScheduledTask;

/// Load the snapshot; a missing file is an empty list.
pub fn load(path: &Path) -> Vec<ScheduledTask> {
    if !path.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(path = %path.display(), "task snapshot unreadable: {e}");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), "task snapshot unreadable: {e}");
            Vec::new()
        }
    }
}

/// Rewrite the snapshot (indented, UTF-8).
pub fn save(path: &Path, tasks: &[ScheduledTask]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let doc = serde_json::to_string_pretty(tasks)?;
    std::fs::write(path, doc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let tasks = vec![ScheduledTask {
            id: "t1".into(),
            time_hm: "09:00".into(),
            command: "/ping".into(),
            enabled: true,
            description: "morning check".into(),
            last_run_date: None,
            created_at: "2026-01-01T00:00:00Z".into(),
        }];
        save(&path, &tasks).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].time_hm, "09:00");
        assert_eq!(loaded[0].command, "/ping");
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_empty());
    }
}
