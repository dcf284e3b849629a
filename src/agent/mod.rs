//! Per-device execution: the step executor, the run loop and device workers.

mod run_loop;
mod step_executor;
mod worker;

pub use run_loop::{AgentRunLoop, RunError, RunLoopConfig, RunState};
pub use step_executor::{StepExecutor, StepReport};
pub use worker::{DeviceWorker, WorkerPool, DEFAULT_POLL_INTERVAL};
