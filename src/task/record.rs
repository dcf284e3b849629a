//! Execution records and history queries.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::DecisionKind;

/// Maximum number of log lines kept per record.
pub const MAX_LOG_LINES: usize = 200;

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Immutable audit entry for one terminated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub item_id: String,
    pub plan_id: String,
    pub step_id: String,
    pub task: String,
    pub device_id: String,
    pub decision: DecisionKind,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration_secs: f64,
    pub success: bool,
    pub status: RunStatus,
    /// Machine error code, e.g. `"TimedOut"` or `"DeviceUnreachable: ..."`.
    pub error: Option<String>,
    /// Human-readable outcome.
    pub summary: String,
    pub logs: Vec<String>,
    pub steps_executed: u32,
}

impl ExecutionRecord {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Timestamped, capped log lines for a run.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    /// Append `[HH:MM:SS] message`, dropping the oldest line past the cap.
    pub fn push(&mut self, message: impl AsRef<str>) {
        if self.lines.len() >= MAX_LOG_LINES {
            self.lines.remove(0);
        }
        self.lines.push(format!(
            "[{}] {}",
            Local::now().format("%H:%M:%S"),
            message.as_ref()
        ));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// History query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryFilter {
    pub device_id: Option<String>,
    pub plan_id: Option<String>,
    pub success: Option<bool>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Local>>,
    pub until: Option<DateTime<Local>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Default::default()
        }
    }

    pub fn plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.device_id.as_ref().map_or(true, |d| *d == record.device_id)
            && self.plan_id.as_ref().map_or(true, |p| *p == record.plan_id)
            && self.success.map_or(true, |s| s == record.success)
            && self.status.map_or(true, |s| s == record.status)
            && self.since.map_or(true, |t| record.started_at >= t)
            && self.until.map_or(true, |t| record.started_at <= t)
    }

    /// Matching records in chronological order.
    pub fn apply<'a>(&self, records: &'a [ExecutionRecord]) -> Vec<&'a ExecutionRecord> {
        let matched: Vec<&ExecutionRecord> = records.iter().filter(|r| self.matches(r)).collect();
        match self.limit {
            Some(limit) if matched.len() > limit => matched[matched.len() - limit..].to_vec(),
            _ => matched,
        }
    }
}

/// Per-device success counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub total: usize,
    pub success: usize,
}

/// Aggregates over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// Percentage, 0..=100.
    pub success_rate: f64,
    pub avg_duration_secs: f64,
    pub avg_steps: f64,
    /// The five most frequent error codes with their counts.
    pub top_errors: Vec<(String, usize)>,
    pub by_device: BTreeMap<String, DeviceStats>,
    /// Runs per start day (`YYYY-MM-DD`).
    pub by_day: BTreeMap<String, usize>,
}

impl HistoryStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut stats = Self::default();
        let mut duration = 0.0;
        let mut steps = 0u64;
        let mut errors: HashMap<String, usize> = HashMap::new();

        for record in records {
            stats.total += 1;
            if record.success {
                stats.success += 1;
            } else {
                stats.failed += 1;
            }
            duration += record.duration_secs;
            steps += u64::from(record.steps_executed);

            if let Some(error) = &record.error {
                *errors.entry(error_kind(error).to_string()).or_default() += 1;
            }

            let device = stats.by_device.entry(record.device_id.clone()).or_default();
            device.total += 1;
            if record.success {
                device.success += 1;
            }

            *stats
                .by_day
                .entry(record.started_at.format("%Y-%m-%d").to_string())
                .or_default() += 1;
        }

        if stats.total > 0 {
            let total = stats.total as f64;
            stats.success_rate = stats.success as f64 * 100.0 / total;
            stats.avg_duration_secs = duration / total;
            stats.avg_steps = steps as f64 / total;
        }

        let mut top: Vec<(String, usize)> = errors.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(5);
        stats.top_errors = top;

        stats
    }
}

/// Error code without its detail (`"DeviceUnreachable: x"` → `"DeviceUnreachable"`).
fn error_kind(error: &str) -> &str {
    error.split(':').next().unwrap_or(error).trim()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn record(device: &str, success: bool, error: Option<&str>) -> ExecutionRecord {
        let started_at = Local.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        ExecutionRecord {
            id: ExecutionRecord::new_id(),
            item_id: "plan/step".to_string(),
            plan_id: "plan".to_string(),
            step_id: "step".to_string(),
            task: "task".to_string(),
            device_id: device.to_string(),
            decision: DecisionKind::LocalStep,
            started_at,
            finished_at: started_at + Duration::seconds(10),
            duration_secs: 10.0,
            success,
            status: if success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            error: error.map(str::to_string),
            summary: String::new(),
            logs: Vec::new(),
            steps_executed: 4,
        }
    }

    #[test]
    fn test_run_log_is_capped() {
        let mut log = RunLog::default();
        for i in 0..(MAX_LOG_LINES + 5) {
            log.push(format!("line {}", i));
        }
        let lines = log.into_lines();
        assert_eq!(lines.len(), MAX_LOG_LINES);
        assert!(lines[0].ends_with("line 5"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn test_filter() {
        let records = vec![
            record("d1", true, None),
            record("d2", false, Some("TimedOut")),
            record("d1", false, Some("Cancelled")),
        ];

        assert_eq!(HistoryFilter::device("d1").apply(&records).len(), 2);

        let failed = HistoryFilter {
            success: Some(false),
            limit: Some(1),
            ..Default::default()
        };
        let matched = failed.apply(&records);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].error.as_deref(), Some("Cancelled"));

        let later = HistoryFilter {
            since: Some(Local.with_ymd_and_hms(2024, 6, 4, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(later.apply(&records).is_empty());
    }

    #[test]
    fn test_stats() {
        let records = vec![
            record("d1", true, None),
            record("d1", false, Some("DeviceUnreachable: offline")),
            record("d2", false, Some("DeviceUnreachable: gone")),
            record("d2", false, Some("TimedOut")),
        ];
        let stats = HistoryStats::from_records(&records);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.success_rate, 25.0);
        assert_eq!(stats.avg_steps, 4.0);
        assert_eq!(stats.top_errors[0], ("DeviceUnreachable".to_string(), 2));
        assert_eq!(stats.by_device["d2"].total, 2);
        assert_eq!(stats.by_day["2024-06-03"], 4);
    }
}
