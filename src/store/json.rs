//! File-backed store: `plans/<id>.json`, `schedules.json` and
//! `history.jsonl` under one data directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{StateStore, StoreError};
use crate::schedule::ScheduleRule;
use crate::task::{ExecutionRecord, TaskPlan};

const PLANS_DIR: &str = "plans";
const RULES_FILE: &str = "schedules.json";
const HISTORY_FILE: &str = "history.jsonl";

/// JSON files in a data directory.
///
/// Each plan lives in its own file, so saving one never rewrites another.
/// History is one record per line, appended.
pub struct JsonStore {
    dir: PathBuf,
    // Serializes appends and rewrites of history.jsonl.
    history_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(PLANS_DIR)).map_err(|e| StoreError::IoError(e.to_string()))?;
        tracing::debug!(dir = %dir.display(), "Opened state store");

        Ok(Self {
            dir,
            history_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    fn plan_path(&self, plan_id: &str) -> PathBuf {
        let name: String = plan_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(PLANS_DIR).join(format!("{}.json", name))
    }

    /// Caller holds `history_lock`.
    fn read_records(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::IoError(e.to_string()))?;

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn last line after a crash should not lose the rest.
                Err(e) => tracing::warn!(line = n + 1, "Skipping unreadable history line: {}", e),
            }
        }
        Ok(records)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| StoreError::IoError(e.to_string()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::ParseError(format!("{}: {}", path.display(), e)))
}

/// Write via a sibling temp file and rename, so readers never see half a file.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content =
        serde_json::to_string_pretty(value).map_err(|e| StoreError::SerializeError(e.to_string()))?;
    write_atomic(path, &content)
}

fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| StoreError::IoError(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::IoError(e.to_string()))
}

impl StateStore for JsonStore {
    fn load_plans(&self) -> Result<Vec<TaskPlan>, StoreError> {
        let entries =
            fs::read_dir(self.dir.join(PLANS_DIR)).map_err(|e| StoreError::IoError(e.to_string()))?;

        let mut plans = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::IoError(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<TaskPlan>(&path) {
                Ok(Some(plan)) => plans.push(plan),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable plan: {}", e),
            }
        }
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    fn save_plan(&self, plan: &TaskPlan) -> Result<(), StoreError> {
        write_json(&self.plan_path(&plan.id), plan)
    }

    fn delete_plan(&self, plan_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.plan_path(plan_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(StoreError::IoError(e.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn load_rules(&self) -> Result<Vec<ScheduleRule>, StoreError> {
        Ok(read_json(&self.dir.join(RULES_FILE))?.unwrap_or_default())
    }

    fn save_rules(&self, rules: &[ScheduleRule]) -> Result<(), StoreError> {
        write_json(&self.dir.join(RULES_FILE), rules)
    }

    fn append_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let line =
            serde_json::to_string(record).map_err(|e| StoreError::SerializeError(e.to_string()))?;

        let _guard = self.history_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .map_err(|e| StoreError::IoError(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| StoreError::IoError(e.to_string()))
    }

    fn load_records(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let _guard = self.history_lock.lock();
        self.read_records()
    }

    fn purge_records(&self, before: DateTime<Local>) -> Result<usize, StoreError> {
        // Held across read and rewrite so no append lands in between.
        let _guard = self.history_lock.lock();
        let records = self.read_records()?;
        let total = records.len();
        let kept: Vec<&ExecutionRecord> =
            records.iter().filter(|r| r.started_at >= before).collect();

        let mut content = String::new();
        for record in &kept {
            let line = serde_json::to_string(record)
                .map_err(|e| StoreError::SerializeError(e.to_string()))?;
            content.push_str(&line);
            content.push('\n');
        }

        write_atomic(&self.history_path(), &content)?;
        Ok(total - kept.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionKind;
    use crate::schedule::{ScheduleRule, Trigger};
    use crate::task::{sample_record, PlanSpec, StepDefaults, StepStatus};
    use chrono::Duration;

    fn plan() -> TaskPlan {
        TaskPlan::from_spec(
            PlanSpec::single("打开微信"),
            &StepDefaults::default(),
            |_| DecisionKind::LocalStep,
        )
    }

    #[test]
    fn test_plans_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan();

        let store = JsonStore::open(dir.path()).unwrap();
        store.save_plan(&plan).unwrap();
        plan.steps[0].status = StepStatus::Running;
        store.save_plan(&plan).unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        let plans = reopened.load_plans().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].steps[0].status, StepStatus::Running);
        assert!(!dir.path().join(PLANS_DIR).join(format!("{}.tmp", plan.id)).exists());
    }

    #[test]
    fn test_each_plan_has_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let first = plan();
        let second = plan();
        store.save_plan(&first).unwrap();
        store.save_plan(&second).unwrap();

        let first_path = store.plan_path(&first.id);
        let before = fs::read_to_string(&first_path).unwrap();
        let mut changed = second.clone();
        changed.steps[0].status = StepStatus::Success;
        store.save_plan(&changed).unwrap();
        assert_eq!(fs::read_to_string(&first_path).unwrap(), before);

        store.delete_plan(&second.id).unwrap();
        assert!(!store.plan_path(&second.id).exists());
        let plans = store.load_plans().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, first.id);

        // deleting twice is fine
        store.delete_plan(&second.id).unwrap();
    }

    #[test]
    fn test_unreadable_plan_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.save_plan(&plan()).unwrap();
        fs::write(dir.path().join(PLANS_DIR).join("broken.json"), "{\"id\": ").unwrap();

        assert_eq!(store.load_plans().unwrap().len(), 1);
    }

    #[test]
    fn test_rules_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.load_rules().unwrap().is_empty());

        let rule = ScheduleRule::new(
            "hourly check",
            Trigger::Interval { every_secs: 3600 },
            PlanSpec::single("查看消息"),
        );
        store.save_rules(&[rule.clone()]).unwrap();
        assert_eq!(store.load_rules().unwrap(), vec![rule]);
    }

    #[test]
    fn test_history_append_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let old = sample_record("D1", true, None);
        let mut recent = sample_record("D1", false, Some("TimedOut"));
        recent.started_at = old.started_at + Duration::days(2);
        store.append_record(&old).unwrap();
        store.append_record(&recent).unwrap();
        assert_eq!(store.load_records().unwrap().len(), 2);

        let removed = store
            .purge_records(old.started_at + Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.load_records().unwrap(), vec![recent]);
    }

    #[test]
    fn test_torn_history_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.append_record(&sample_record("D1", true, None)).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(HISTORY_FILE))
            .unwrap()
            .write_all(b"{\"id\": \"trunc")
            .unwrap();

        assert_eq!(store.load_records().unwrap().len(), 1);
    }
}
