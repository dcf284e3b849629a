//! Persisted orchestration state: plans, schedule rules and run history.

mod json;

pub use json::JsonStore;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use thiserror::Error;

use crate::schedule::ScheduleRule;
use crate::task::{ExecutionRecord, TaskPlan};

/// Persistence errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

/// Storage behind the queue and the scheduler.
///
/// Each plan is saved whole on every change, independently of the others;
/// records are append-only.
pub trait StateStore: Send + Sync {
    fn load_plans(&self) -> Result<Vec<TaskPlan>, StoreError>;
    fn save_plan(&self, plan: &TaskPlan) -> Result<(), StoreError>;
    /// Remove a plan. Unknown ids are not an error.
    fn delete_plan(&self, plan_id: &str) -> Result<(), StoreError>;

    fn load_rules(&self) -> Result<Vec<ScheduleRule>, StoreError>;
    fn save_rules(&self, rules: &[ScheduleRule]) -> Result<(), StoreError>;

    fn append_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
    fn load_records(&self) -> Result<Vec<ExecutionRecord>, StoreError>;
    /// Remove records that started before `before`. Returns how many went.
    fn purge_records(&self, before: DateTime<Local>) -> Result<usize, StoreError>;
}

/// Volatile store, for tests and `run` mode.
#[derive(Default)]
pub struct MemoryStore {
    plans: Mutex<Vec<TaskPlan>>,
    rules: Mutex<Vec<ScheduleRule>>,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load_plans(&self) -> Result<Vec<TaskPlan>, StoreError> {
        Ok(self.plans.lock().clone())
    }

    fn save_plan(&self, plan: &TaskPlan) -> Result<(), StoreError> {
        let mut plans = self.plans.lock();
        match plans.iter_mut().find(|p| p.id == plan.id) {
            Some(existing) => *existing = plan.clone(),
            None => plans.push(plan.clone()),
        }
        Ok(())
    }

    fn delete_plan(&self, plan_id: &str) -> Result<(), StoreError> {
        self.plans.lock().retain(|p| p.id != plan_id);
        Ok(())
    }

    fn load_rules(&self) -> Result<Vec<ScheduleRule>, StoreError> {
        Ok(self.rules.lock().clone())
    }

    fn save_rules(&self, rules: &[ScheduleRule]) -> Result<(), StoreError> {
        *self.rules.lock() = rules.to_vec();
        Ok(())
    }

    fn append_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load_records(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn purge_records(&self, before: DateTime<Local>) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        let len = records.len();
        records.retain(|r| r.started_at >= before);
        Ok(len - records.len())
    }
}
