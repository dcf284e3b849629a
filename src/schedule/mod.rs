//! Time rules that submit plans on their own.

mod rule;
mod scheduler;

pub use rule::{ScheduleRule, TimeRange, Trigger};
pub use scheduler::{PlanSink, ScheduleError, Scheduler};
