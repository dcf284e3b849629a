//! Decision backends: where the next device action comes from.
//!
//! A backend looks at the task, the steps taken so far and the current
//! screen, and answers with one [`ActionDecision`]. Two implementations
//! exist: [`LocalStepDecision`] (a vision model queried step by step) and
//! [`RemoteWorkflowDecision`] (a chat-style workflow engine). The
//! [`DecisionRouter`] picks one per task.

mod local;
mod remote;
mod router;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Screenshot;

pub use local::LocalStepDecision;
pub use remote::{RemoteWorkflowConfig, RemoteWorkflowDecision};
pub use router::{classify, DecisionRouter};

/// Which backend family a step is routed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    #[default]
    LocalStep,
    RemoteWorkflow,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::LocalStep => write!(f, "local_step"),
            DecisionKind::RemoteWorkflow => write!(f, "remote_workflow"),
        }
    }
}

/// Longest settle delay a decision may ask for.
pub const MAX_WAIT_SECS: f64 = 60.0;

/// The normalized answer of every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    /// Instruction handed to the device transport. Empty when `completed`.
    pub instruction: String,
    /// Settle delay after the action, in seconds.
    pub wait_seconds: f64,
    pub completed: bool,
    pub summary: Option<String>,
    /// Backend reasoning, kept for run logs.
    #[serde(default)]
    pub thinking: Option<String>,
}

impl ActionDecision {
    pub fn act(instruction: impl Into<String>, wait_seconds: f64) -> Self {
        Self {
            instruction: instruction.into(),
            wait_seconds,
            completed: false,
            summary: None,
            thinking: None,
        }
    }

    /// Settle delay to apply, capped at [`MAX_WAIT_SECS`].
    /// Non-finite or negative values mean no delay.
    pub fn settle_delay(&self) -> Duration {
        if self.wait_seconds.is_finite() && self.wait_seconds > 0.0 {
            Duration::from_secs_f64(self.wait_seconds.min(MAX_WAIT_SECS))
        } else {
            Duration::ZERO
        }
    }

    pub fn complete(summary: impl Into<String>) -> Self {
        Self {
            instruction: String::new(),
            wait_seconds: 0.0,
            completed: true,
            summary: Some(summary.into()),
            thinking: None,
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        let thinking = thinking.into();
        if !thinking.is_empty() {
            self.thinking = Some(thinking);
        }
        self
    }
}

/// One executed step as seen by the backend on later turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: u32,
    pub instruction: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Everything a backend may use to decide the next action.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    /// Queue item id; remote backends key conversations on it.
    pub item_id: &'a str,
    pub device_id: &'a str,
    pub task: &'a str,
    pub history: &'a [StepOutcome],
    pub screenshot: &'a Screenshot,
}

/// Decision backend errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    /// The backend answered, but not with a usable decision.
    #[error("Malformed decision: {0}")]
    Malformed(String),
    /// The backend could not be reached within its retry budget.
    #[error("DecisionUnavailable: {0}")]
    Unavailable(String),
}

/// A source of next-action decisions.
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    fn kind(&self) -> DecisionKind;

    /// Decide the next action for `ctx`.
    async fn next_action(&self, ctx: &DecisionContext<'_>) -> Result<ActionDecision, DecisionError>;

    /// Forget per-run state (conversation ids, message history) for `item_id`.
    async fn finish_run(&self, _item_id: &str, _device_id: &str) {}
}
