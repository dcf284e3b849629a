//! Task steps and their dependency conditions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decision::DecisionKind;

/// Lifecycle of a step inside its plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Waiting in the queue (not yet dispatched).
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

/// When a step may run, given the outcome of its dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// Every dependency succeeded.
    #[default]
    OnSuccess,
    /// At least one dependency failed or was skipped.
    OnFailure,
    /// Every dependency finished, whatever the outcome.
    Always,
}

impl StepCondition {
    /// `Some(true)` once runnable, `Some(false)` once it can never run,
    /// `None` while undecided. A step without dependencies is always runnable.
    pub fn evaluate(self, deps: &[StepStatus]) -> Option<bool> {
        if deps.is_empty() {
            return Some(true);
        }
        let unsuccessful = deps
            .iter()
            .any(|s| matches!(s, StepStatus::Failed | StepStatus::Skipped));
        let all_terminal = deps.iter().all(|s| s.is_terminal());

        match self {
            Self::OnSuccess if unsuccessful => Some(false),
            _ if !all_terminal => None,
            Self::OnSuccess | Self::Always => Some(true),
            Self::OnFailure => Some(unsuccessful),
        }
    }
}

/// Per-step limits applied when a [`StepSpec`] leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefaults {
    pub max_retries: u32,
    pub timeout: Duration,
    pub max_steps: u32,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_secs(600),
            max_steps: 100,
        }
    }
}

/// Submission form of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSpec {
    /// Unique within the plan; generated as `step-N` when empty.
    pub id: Option<String>,
    pub instruction: String,
    /// Devices the step needs; empty means any single device.
    pub devices: Vec<String>,
    pub depends_on: Vec<String>,
    pub condition: StepCondition,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_steps: Option<u32>,
    pub decision: Option<DecisionKind>,
    /// Failure of an optional step does not fail the plan.
    pub optional: bool,
}

impl StepSpec {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn on_device(mut self, device_id: impl Into<String>) -> Self {
        self.devices.push(device_id.into());
        self
    }

    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_decision(mut self, kind: DecisionKind) -> Self {
        self.decision = Some(kind);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// One unit of work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub instruction: String,
    pub devices: Vec<String>,
    pub depends_on: Vec<String>,
    pub condition: StepCondition,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub max_steps: u32,
    pub decision: DecisionKind,
    pub optional: bool,
    pub status: StepStatus,
    /// Device the step ran (or is running) on.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub steps_executed: u32,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Manual retries spent so far, bounded by `max_retries`.
    #[serde(default)]
    pub retry_count: u32,
    /// Queue priority override; the plan's priority applies otherwise.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl TaskStep {
    /// Build a step from its spec; `index` numbers generated ids.
    pub fn from_spec(
        spec: StepSpec,
        index: usize,
        defaults: &StepDefaults,
        decision: DecisionKind,
    ) -> Self {
        let id = spec
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("step-{}", index + 1));

        Self {
            id,
            instruction: spec.instruction,
            devices: spec.devices,
            depends_on: spec.depends_on,
            condition: spec.condition,
            max_retries: spec.max_retries.unwrap_or(defaults.max_retries),
            timeout_secs: spec
                .timeout_secs
                .unwrap_or_else(|| defaults.timeout.as_secs()),
            max_steps: spec.max_steps.unwrap_or(defaults.max_steps),
            decision,
            optional: spec.optional,
            status: StepStatus::Pending,
            device_id: None,
            steps_executed: 0,
            last_action: None,
            error: None,
            retry_count: 0,
            priority: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_count < self.max_retries
    }

    /// Back to pending, forgetting the last run.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.device_id = None;
        self.steps_executed = 0;
        self.last_action = None;
        self.error = None;
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether this step can run on `device_id`.
    pub fn accepts_device(&self, device_id: &str) -> bool {
        self.devices.is_empty() || self.devices.iter().any(|d| d == device_id)
    }
}
