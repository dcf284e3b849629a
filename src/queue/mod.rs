//! Task queue, device leases and execution history.

mod lease;
mod manager;
mod persist;

pub use lease::{CancelFlag, DeviceLease};
pub use manager::{
    item_id, CancelOutcome, PlanSnapshot, QueueError, RestoreSummary, TaskItem, TaskQueueManager,
};
