//! The per-item control loop: observe, decide, act, feed back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use super::step_executor::StepExecutor;
use crate::decision::{
    ActionDecision, DecisionBackend, DecisionContext, DecisionError, DecisionRouter, StepOutcome,
};
use crate::queue::{TaskItem, TaskQueueManager};
use crate::task::{ExecutionRecord, RunLog, RunStatus};
use crate::transport::{Screenshot, TransportError};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Stepping,
    Waiting,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Why a run stopped without completing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("DeviceUnreachable: {0}")]
    DeviceUnreachable(String),
    #[error("ActionRejected: {0}")]
    ActionRejected(String),
    #[error("DecisionUnavailable: {0}")]
    DecisionUnavailable(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("TimedOut")]
    TimedOut,
}

impl RunError {
    pub fn state(&self) -> RunState {
        match self {
            Self::Cancelled => RunState::Cancelled,
            Self::TimedOut => RunState::TimedOut,
            _ => RunState::Failed,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Cancelled => RunStatus::Cancelled,
            Self::TimedOut => RunStatus::TimedOut,
            _ => RunStatus::Failed,
        }
    }
}

impl From<TransportError> for RunError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceUnreachable(m) => Self::DeviceUnreachable(m),
            TransportError::ActionRejected(m) => Self::ActionRejected(m),
        }
    }
}

/// Timing knobs shared by every run.
#[derive(Debug, Clone)]
pub struct RunLoopConfig {
    /// Upper bound for one decision call.
    pub decision_timeout: Duration,
    /// Upper bound for one transport call.
    pub action_timeout: Duration,
    /// Pause between transport retries.
    pub retry_delay: Duration,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(120),
            action_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Per-run mutable state.
struct Run<'a> {
    item: &'a TaskItem,
    backend: Arc<dyn DecisionBackend>,
    started: Instant,
    deadline: Instant,
    state: RunState,
    steps: u32,
    history: Vec<StepOutcome>,
    log: RunLog,
}

impl Run<'_> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn transition(&mut self, state: RunState) {
        if self.state != state {
            tracing::debug!(item = %self.item.id, from = ?self.state, to = ?state, "Run state");
            self.state = state;
        }
    }
}

/// Drives one dispatched item to a terminal state and reports it.
pub struct AgentRunLoop {
    executor: StepExecutor,
    router: DecisionRouter,
    queue: Arc<TaskQueueManager>,
    config: RunLoopConfig,
}

impl AgentRunLoop {
    pub fn new(
        executor: StepExecutor,
        router: DecisionRouter,
        queue: Arc<TaskQueueManager>,
        config: RunLoopConfig,
    ) -> Self {
        Self {
            executor,
            router,
            queue,
            config,
        }
    }

    /// Run `item`, hand its record to the queue, and return the record.
    pub async fn run(&self, item: TaskItem) -> ExecutionRecord {
        let started_at = Local::now();
        let started = Instant::now();
        let backend = self.router.backend(item.decision);

        let mut run = Run {
            item: &item,
            backend: Arc::clone(&backend),
            started,
            deadline: started + item.timeout,
            state: RunState::Starting,
            steps: 0,
            history: Vec::new(),
            log: RunLog::default(),
        };

        tracing::info!(
            device = %item.device_id,
            item = %item.id,
            decision = %item.decision,
            "Run started: {}",
            item.instruction
        );
        run.log.push(format!("Task: {}", item.instruction));
        run.log.push(format!("Device: {} ({})", item.device_id, item.decision));

        let outcome = self.drive(&mut run).await;
        backend.finish_run(&item.id, &item.device_id).await;

        let record = self.finish(run, outcome, started_at);
        if let Err(e) = self.queue.report_result(&item.id, record.clone()) {
            tracing::error!(item = %item.id, "Failed to report result: {}", e);
        }
        record
    }

    async fn drive(&self, run: &mut Run<'_>) -> Result<String, RunError> {
        let item = run.item;
        let mut screenshot = self.capture_with_retries(run).await?;

        loop {
            run.transition(RunState::Stepping);

            if item.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            if run.remaining().is_zero() {
                run.log.push("Step timeout reached");
                return Err(RunError::TimedOut);
            }
            if run.steps >= item.max_steps {
                run.log.push(format!("Max steps ({}) reached", item.max_steps));
                return Err(RunError::TimedOut);
            }

            let decision = self.decide(run, &screenshot).await?;
            if let Some(thinking) = &decision.thinking {
                run.log.push(format!("Thinking: {}", thinking));
            }
            if decision.completed {
                let summary = decision
                    .summary
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "Task completed".to_string());
                run.log.push(format!("Finished: {}", summary));
                return Ok(summary);
            }

            run.steps += 1;
            let step = run.steps;
            run.log.push(format!("Step {}: {}", step, decision.instruction));
            if let Err(e) = self
                .queue
                .update_progress(&item.id, step, Some(&decision.instruction))
            {
                tracing::debug!(item = %item.id, "Progress not recorded: {}", e);
            }

            let result = self.act(run, &decision).await;
            run.history.push(StepOutcome {
                step,
                instruction: decision.instruction.clone(),
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
            });
            screenshot = result?;
        }
    }

    /// Ask the backend, bounded by the decision timeout and the run budget.
    /// A malformed answer earns one re-query on the same screen.
    async fn decide(
        &self,
        run: &mut Run<'_>,
        screenshot: &Screenshot,
    ) -> Result<ActionDecision, RunError> {
        let item = run.item;
        let mut malformed = false;

        loop {
            let remaining = run.remaining();
            let budget_bound = remaining <= self.config.decision_timeout;
            let limit = remaining.min(self.config.decision_timeout);

            let ctx = DecisionContext {
                item_id: &item.id,
                device_id: &item.device_id,
                task: &item.instruction,
                history: &run.history,
                screenshot,
            };

            match timeout(limit, run.backend.next_action(&ctx)).await {
                Ok(Ok(decision)) => return Ok(decision),
                Ok(Err(DecisionError::Malformed(reason))) if !malformed => {
                    tracing::warn!(item = %item.id, "Malformed decision, asking again: {}", reason);
                    run.log.push(format!("Malformed decision: {}", reason));
                    malformed = true;
                }
                Ok(Err(DecisionError::Malformed(reason))) => {
                    return Err(RunError::DecisionUnavailable(format!(
                        "malformed twice: {}",
                        reason
                    )));
                }
                Ok(Err(DecisionError::Unavailable(reason))) => {
                    return Err(RunError::DecisionUnavailable(reason));
                }
                Err(_) if budget_bound => {
                    run.log.push("Step timeout reached while deciding");
                    return Err(RunError::TimedOut);
                }
                Err(_) => {
                    return Err(RunError::DecisionUnavailable(format!(
                        "no decision within {:.0}s",
                        limit.as_secs_f64()
                    )));
                }
            }
        }
    }

    /// Apply one decision, retrying transport failures up to `max_retries`.
    /// Returns the screen after the action.
    async fn act(&self, run: &mut Run<'_>, decision: &ActionDecision) -> Result<Screenshot, RunError> {
        let item = run.item;
        let wait_after = decision.settle_delay();
        let mut applied = false;
        let mut attempt = 0;

        loop {
            let error = if applied {
                // Only the capture failed last time; do not repeat the action.
                match self
                    .executor
                    .capture(&item.device_id, self.config.action_timeout)
                    .await
                {
                    Ok(screenshot) => return Ok(screenshot),
                    Err(e) => e,
                }
            } else {
                run.transition(RunState::Waiting);
                let report = self
                    .executor
                    .execute(
                        &item.device_id,
                        &decision.instruction,
                        wait_after,
                        self.config.action_timeout,
                    )
                    .await;
                applied = report.applied;
                match (report.screenshot, report.error) {
                    (Some(screenshot), None) => return Ok(screenshot),
                    (_, Some(e)) => e,
                    (None, None) => {
                        TransportError::DeviceUnreachable("no screenshot after action".to_string())
                    }
                }
            };

            if attempt >= item.max_retries {
                run.log.push(format!("Giving up: {}", error));
                return Err(error.into());
            }
            attempt += 1;
            tracing::warn!(
                device = %item.device_id,
                item = %item.id,
                attempt,
                max_retries = item.max_retries,
                "Transport error, retrying: {}",
                error
            );
            run.log.push(format!("Retry {}/{}: {}", attempt, item.max_retries, error));

            if item.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            sleep(self.config.retry_delay.min(run.remaining())).await;
        }
    }

    async fn capture_with_retries(&self, run: &mut Run<'_>) -> Result<Screenshot, RunError> {
        let item = run.item;
        let mut attempt = 0;
        loop {
            match self
                .executor
                .capture(&item.device_id, self.config.action_timeout)
                .await
            {
                Ok(screenshot) => {
                    if screenshot.is_sensitive {
                        run.log.push("Sensitive screen, capture blanked");
                    }
                    return Ok(screenshot);
                }
                Err(e) if attempt < item.max_retries => {
                    attempt += 1;
                    tracing::warn!(device = %item.device_id, attempt, "Initial capture failed: {}", e);
                    sleep(self.config.retry_delay.min(run.remaining())).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish(
        &self,
        mut run: Run<'_>,
        outcome: Result<String, RunError>,
        started_at: chrono::DateTime<Local>,
    ) -> ExecutionRecord {
        let item = run.item;
        let elapsed = run.started.elapsed();

        let (status, error, summary) = match outcome {
            Ok(summary) => {
                run.transition(RunState::Completed);
                (RunStatus::Completed, None, summary)
            }
            Err(e) => {
                run.transition(e.state());
                let summary = match &e {
                    RunError::Cancelled => format!("Cancelled after {} steps", run.steps),
                    RunError::TimedOut => format!(
                        "Timed out after {} steps ({:.1}s)",
                        run.steps,
                        elapsed.as_secs_f64()
                    ),
                    other => format!("Failed after {} steps: {}", run.steps, other),
                };
                run.log.push(&summary);
                (e.status(), Some(e.to_string()), summary)
            }
        };

        let success = status == RunStatus::Completed;
        if success {
            tracing::info!(device = %item.device_id, item = %item.id, steps = run.steps, "Run completed");
        } else {
            tracing::warn!(
                device = %item.device_id,
                item = %item.id,
                steps = run.steps,
                status = ?status,
                "Run ended: {}",
                summary
            );
        }

        ExecutionRecord {
            id: ExecutionRecord::new_id(),
            item_id: item.id.clone(),
            plan_id: item.plan_id.clone(),
            step_id: item.step_id.clone(),
            task: item.instruction.clone(),
            device_id: item.device_id.clone(),
            decision: item.decision,
            started_at,
            finished_at: Local::now(),
            duration_secs: elapsed.as_secs_f64(),
            success,
            status,
            error,
            summary,
            logs: run.log.into_lines(),
            steps_executed: run.steps,
        }
    }
}
