//! Task intake: the one entry point that wires queue, scheduler and workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::agent::{AgentRunLoop, RunLoopConfig, StepExecutor, WorkerPool, DEFAULT_POLL_INTERVAL};
use crate::decision::DecisionRouter;
use crate::queue::{CancelOutcome, DeviceLease, PlanSnapshot, QueueError, TaskQueueManager};
use crate::schedule::{PlanSink, ScheduleError, ScheduleRule, Scheduler};
use crate::store::{StateStore, StoreError};
use crate::task::{
    ExecutionRecord, HistoryFilter, HistoryStats, PlanSpec, StepDefaults, StepSpec, TaskPlan,
};
use crate::transport::DeviceTransport;

/// Orchestrator errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Workers are already running")]
    AlreadyStarted,
    #[error("No devices configured")]
    NoDevices,
    #[error("Timed out waiting for plan {0}")]
    WaitTimedOut(String),
}

/// What a cancel request hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReport {
    Plan { skipped: usize, signalled: usize },
    Item(CancelOutcome),
}

/// Turns submissions into routed plans on the queue.
pub struct Intake {
    queue: Arc<TaskQueueManager>,
    router: DecisionRouter,
    defaults: StepDefaults,
}

impl Intake {
    pub fn new(queue: Arc<TaskQueueManager>, router: DecisionRouter, defaults: StepDefaults) -> Self {
        Self {
            queue,
            router,
            defaults,
        }
    }

    /// Build a plan, stamping each step with its decision kind.
    pub fn build(&self, spec: PlanSpec) -> TaskPlan {
        TaskPlan::from_spec(spec, &self.defaults, |step: &StepSpec| {
            self.router.route(&step.instruction, step.decision)
        })
    }
}

impl PlanSink for Intake {
    fn submit(&self, spec: PlanSpec) -> Result<String, QueueError> {
        self.queue.submit_plan(self.build(spec))
    }
}

/// Options for [`Orchestrator::new`].
#[derive(Clone)]
pub struct OrchestratorOptions {
    pub defaults: StepDefaults,
    pub run_loop: RunLoopConfig,
    pub poll_interval: Duration,
    pub scheduler_tick: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            defaults: StepDefaults::default(),
            run_loop: RunLoopConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            scheduler_tick: Duration::from_secs(10),
        }
    }
}

struct Running {
    pool: WorkerPool,
    scheduler: JoinHandle<()>,
}

pub struct Orchestrator {
    queue: Arc<TaskQueueManager>,
    intake: Arc<Intake>,
    scheduler: Arc<Scheduler>,
    run_loop: Arc<AgentRunLoop>,
    options: OrchestratorOptions,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    /// Wire the components. With a store, persisted plans, history and
    /// rules are restored before anything runs.
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        router: DecisionRouter,
        store: Option<Arc<dyn StateStore>>,
        options: OrchestratorOptions,
    ) -> Result<Self, OrchestratorError> {
        let mut queue = TaskQueueManager::new();
        if let Some(store) = &store {
            queue.restore_from(store.as_ref())?;
            queue = queue.with_store(Arc::clone(store));
        }
        let queue = Arc::new(queue);

        let intake = Arc::new(Intake::new(queue.clone(), router.clone(), options.defaults));
        let mut scheduler = Scheduler::new(intake.clone());
        if let Some(store) = &store {
            scheduler = scheduler.with_store(Arc::clone(store));
            scheduler.load_rules()?;
        }

        let run_loop = Arc::new(AgentRunLoop::new(
            StepExecutor::new(transport),
            router,
            queue.clone(),
            options.run_loop.clone(),
        ));

        Ok(Self {
            queue,
            intake,
            scheduler: Arc::new(scheduler),
            run_loop,
            options,
            running: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueueManager> {
        &self.queue
    }

    /// Validate and enqueue a plan. Returns its id.
    pub fn submit_plan(&self, spec: PlanSpec) -> Result<String, OrchestratorError> {
        Ok(self.intake.submit(spec)?)
    }

    /// Single-step plan for `instruction`.
    pub fn submit_task(&self, instruction: &str) -> Result<String, OrchestratorError> {
        self.submit_plan(PlanSpec::single(instruction))
    }

    /// Cancel a whole plan, or a single item (`plan_id/step_id`).
    pub fn cancel(&self, id: &str) -> Result<CancelReport, OrchestratorError> {
        if self.queue.plan_status(id).is_some() {
            let (skipped, signalled) = self.queue.cancel_plan(id)?;
            return Ok(CancelReport::Plan { skipped, signalled });
        }
        match self.queue.cancel(id) {
            Ok(outcome) => Ok(CancelReport::Item(outcome)),
            Err(QueueError::UnknownItem(_)) => Err(OrchestratorError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel every unfinished plan. Returns (skipped, signalled) totals.
    pub fn cancel_all(&self) -> (usize, usize) {
        self.queue.cancel_all()
    }

    /// Re-queue a failed item (`plan_id/step_id`) within its retry budget.
    pub fn retry(&self, item_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.queue.retry(item_id)?)
    }

    pub fn set_priority(&self, item_id: &str, priority: i32) -> Result<(), OrchestratorError> {
        Ok(self.queue.set_priority(item_id, priority)?)
    }

    pub fn pause_plan(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.queue.pause_plan(plan_id)?)
    }

    pub fn resume_plan(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.queue.resume_plan(plan_id)?)
    }

    /// Run a finished plan again.
    pub fn reset_plan(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.queue.reset_plan(plan_id)?)
    }

    pub fn delete_plan(&self, plan_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.queue.delete_plan(plan_id)?)
    }

    pub fn get_status(&self, plan_id: &str) -> Result<PlanSnapshot, OrchestratorError> {
        self.queue
            .plan_status(plan_id)
            .ok_or_else(|| OrchestratorError::NotFound(plan_id.to_string()))
    }

    pub fn plans(&self) -> Vec<PlanSnapshot> {
        self.queue.plans()
    }

    pub fn list_history(&self, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        self.queue.history(filter)
    }

    pub fn history_stats(&self, filter: &HistoryFilter) -> HistoryStats {
        self.queue.history_stats(filter)
    }

    pub fn purge_history(&self, before: DateTime<Local>) -> usize {
        self.queue.purge_history(before)
    }

    pub fn leases(&self) -> Vec<DeviceLease> {
        self.queue.leases()
    }

    pub fn add_rule(&self, rule: ScheduleRule) -> Result<String, OrchestratorError> {
        Ok(self.scheduler.add_rule(rule)?)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<ScheduleRule, OrchestratorError> {
        Ok(self.scheduler.remove_rule(rule_id)?)
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), OrchestratorError> {
        Ok(self.scheduler.set_enabled(rule_id, enabled)?)
    }

    pub fn rules(&self) -> Vec<ScheduleRule> {
        self.scheduler.rules()
    }

    /// Fire due rules now, outside the background tick.
    pub fn tick_scheduler(&self, now: DateTime<Local>) -> Vec<String> {
        self.scheduler.tick(now.naive_local())
    }

    /// Start one worker per device plus the scheduler loop.
    pub fn start(&self, devices: &[String]) -> Result<(), OrchestratorError> {
        if devices.is_empty() {
            return Err(OrchestratorError::NoDevices);
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(OrchestratorError::AlreadyStarted);
        }

        let pool = WorkerPool::spawn(
            devices,
            self.queue.clone(),
            self.run_loop.clone(),
            self.options.poll_interval,
        );
        let scheduler = tokio::spawn(
            self.scheduler
                .clone()
                .run(self.options.scheduler_tick, pool.shutdown_signal()),
        );
        tracing::info!(devices = ?devices, "Orchestrator started");

        *running = Some(Running { pool, scheduler });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the scheduler and the workers. Items already running finish
    /// first, then pending store writes are flushed.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some(Running { pool, scheduler }) = running {
            pool.stop().await;
            if let Err(e) = scheduler.await {
                tracing::error!("Scheduler task failed: {}", e);
            }
            tracing::info!("Orchestrator stopped");
        }
        self.queue.flush().await;
    }

    /// Wait until `plan_id` reaches a terminal status.
    pub async fn wait_plan(
        &self,
        plan_id: &str,
        limit: Option<Duration>,
    ) -> Result<PlanSnapshot, OrchestratorError> {
        let notify = self.queue.notifier();
        let wait = async {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.get_status(plan_id) {
                    Ok(snapshot) if snapshot.status.is_terminal() => return Ok(snapshot),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        };

        match limit {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| OrchestratorError::WaitTimedOut(plan_id.to_string()))?,
            None => wait.await,
        }
    }
}
