//! Task plans, steps and execution records.

mod plan;
mod record;
mod step;

pub use plan::{PlanError, PlanProgress, PlanSpec, PlanStatus, Promotion, TaskPlan};
pub use record::{
    DeviceStats, ExecutionRecord, HistoryFilter, HistoryStats, RunLog, RunStatus, MAX_LOG_LINES,
};
pub use step::{StepCondition, StepDefaults, StepSpec, StepStatus, TaskStep};

#[cfg(test)]
pub(crate) use record::tests::record as sample_record;
