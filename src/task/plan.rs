//! Task plans: a dependency graph of steps with a derived status.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::decision::DecisionKind;

use super::step::{StepDefaults, StepSpec, StepStatus, TaskStep};

/// Plan graph validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("InvalidDependency: {0}")]
    InvalidDependency(String),
    #[error("DuplicateStep: {0}")]
    DuplicateStep(String),
    #[error("Plan has no steps")]
    EmptyPlan,
    #[error("Step {0} has an empty instruction")]
    EmptyInstruction(String),
}

/// Aggregate status of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    /// Held back from dispatch; running steps still finish.
    Paused,
    Success,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

const SKIP_UNMET: &str = "dependency condition not met";
const SKIP_STOPPED: &str = "plan stopped after a failed step";

/// Skipped by [`TaskPlan::refresh`] rather than by a cancel.
fn skipped_by_refresh(step: &TaskStep) -> bool {
    step.status == StepStatus::Skipped
        && matches!(step.error.as_deref(), Some(SKIP_UNMET) | Some(SKIP_STOPPED))
}

/// Submission form of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Higher runs first.
    pub priority: i32,
    /// Skip every remaining step once a required step fails.
    pub stop_on_failure: bool,
    pub tags: Vec<String>,
    /// Set by the scheduler for plans it creates.
    pub schedule_rule: Option<String>,
}

impl PlanSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Single-step plan named after its instruction.
    pub fn single(instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        Self::new(instruction.clone()).with_step(StepSpec::new(instruction))
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn stop_on_failure(mut self) -> Self {
        self.stop_on_failure = true;
        self
    }
}

/// Step counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Terminal steps as a percentage of all steps.
    pub percent: f32,
}

/// Steps whose status changed during [`TaskPlan::refresh`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Promotion {
    pub ready: Vec<String>,
    pub skipped: Vec<String>,
}

/// An ordered set of steps sharing a name, priority and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub name: String,
    pub steps: Vec<TaskStep>,
    pub schedule_rule: Option<String>,
    pub priority: i32,
    pub stop_on_failure: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: PlanStatus,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub paused: bool,
    pub created_at: DateTime<Local>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl TaskPlan {
    /// Build a plan from `spec`, routing each step through `route`.
    pub fn from_spec(
        spec: PlanSpec,
        defaults: &StepDefaults,
        route: impl Fn(&StepSpec) -> DecisionKind,
    ) -> Self {
        let steps = spec
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let kind = route(&s);
                TaskStep::from_spec(s, i, defaults, kind)
            })
            .collect();

        let name = if spec.name.trim().is_empty() {
            "untitled".to_string()
        } else {
            spec.name
        };

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            steps,
            schedule_rule: spec.schedule_rule,
            priority: spec.priority,
            stop_on_failure: spec.stop_on_failure,
            tags: spec.tags,
            status: PlanStatus::Pending,
            cancelled: false,
            paused: false,
            created_at: Local::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Reject duplicate ids, unknown or self dependencies, and cycles.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
            if step.instruction.trim().is_empty() {
                return Err(PlanError::EmptyInstruction(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(PlanError::InvalidDependency(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::InvalidDependency(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }

        let unresolved = self.unsorted_steps();
        if !unresolved.is_empty() {
            return Err(PlanError::InvalidDependency(format!(
                "dependency cycle through {}",
                unresolved.join(", ")
            )));
        }

        Ok(())
    }

    /// Kahn's algorithm; returns the ids that never reach in-degree zero.
    fn unsorted_steps(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        while let Some(id) = queue.pop_front() {
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        let mut left: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        left.sort();
        left
    }

    /// Re-evaluate pending steps until nothing changes.
    ///
    /// Pending steps whose condition holds become ready; those whose
    /// condition can no longer hold are skipped, which may in turn decide
    /// their own dependents.
    pub fn refresh(&mut self) -> Promotion {
        let mut promotion = Promotion::default();

        if self.stop_on_failure
            && self
                .steps
                .iter()
                .any(|s| s.status == StepStatus::Failed && !s.optional)
        {
            for step in self.steps.iter_mut().filter(|s| s.status.is_queued()) {
                step.status = StepStatus::Skipped;
                step.error = Some(SKIP_STOPPED.to_string());
                promotion.skipped.push(step.id.clone());
            }
            return promotion;
        }

        loop {
            let statuses: HashMap<String, StepStatus> = self
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.status))
                .collect();
            let mut changed = false;

            for step in self
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::Pending)
            {
                let deps: Vec<StepStatus> = step
                    .depends_on
                    .iter()
                    .map(|d| statuses.get(d).copied().unwrap_or(StepStatus::Skipped))
                    .collect();

                match step.condition.evaluate(&deps) {
                    Some(true) => {
                        step.status = StepStatus::Ready;
                        promotion.ready.push(step.id.clone());
                        changed = true;
                    }
                    Some(false) => {
                        step.status = StepStatus::Skipped;
                        step.error = Some(SKIP_UNMET.to_string());
                        promotion.skipped.push(step.id.clone());
                        changed = true;
                    }
                    None => {}
                }
            }

            if !changed {
                return promotion;
            }
        }
    }

    /// Status implied by the current step statuses.
    pub fn derive_status(&self) -> PlanStatus {
        let all_terminal = self.steps.iter().all(|s| s.status.is_terminal());
        if all_terminal {
            if self.cancelled {
                PlanStatus::Cancelled
            } else if self
                .steps
                .iter()
                .any(|s| s.status == StepStatus::Failed && !s.optional)
            {
                PlanStatus::Failed
            } else {
                PlanStatus::Success
            }
        } else if self.paused {
            PlanStatus::Paused
        } else if self.steps.iter().any(|s| !s.status.is_queued()) {
            PlanStatus::Running
        } else {
            PlanStatus::Pending
        }
    }

    /// Store the derived status and stamp start/finish times.
    /// Returns true when the status changed.
    pub fn update_status(&mut self) -> bool {
        let status = self.derive_status();
        if status == self.status {
            return false;
        }

        let now = Local::now();
        if !matches!(status, PlanStatus::Pending | PlanStatus::Paused) && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.finished_at = status.is_terminal().then_some(now);
        self.status = status;
        true
    }

    /// Put a failed step back in the queue for another run.
    ///
    /// Steps its failure skipped go back to pending and are re-evaluated.
    /// Returns false when the step is unknown, not failed, out of retries,
    /// or when another required step has already stopped the plan.
    pub fn retry_step(&mut self, step_id: &str) -> bool {
        if !self.step(step_id).is_some_and(TaskStep::can_retry) {
            return false;
        }
        if self.stop_on_failure
            && self
                .steps
                .iter()
                .any(|s| s.id != step_id && s.status == StepStatus::Failed && !s.optional)
        {
            return false;
        }

        for step in self.steps.iter_mut() {
            if step.id == step_id {
                step.retry_count += 1;
                step.reset();
            } else if skipped_by_refresh(step) {
                step.reset();
            }
        }
        self.refresh();
        self.update_status();
        true
    }

    /// Clear every outcome so the whole plan runs again.
    pub fn reset(&mut self) {
        for step in self.steps.iter_mut() {
            step.reset();
            step.retry_count = 0;
        }
        self.cancelled = false;
        self.paused = false;
        self.status = PlanStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.refresh();
    }

    pub fn progress(&self) -> PlanProgress {
        let mut p = PlanProgress {
            total: self.steps.len(),
            ..Default::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => p.pending += 1,
                StepStatus::Ready => p.ready += 1,
                StepStatus::Running => p.running += 1,
                StepStatus::Success => p.success += 1,
                StepStatus::Failed => p.failed += 1,
                StepStatus::Skipped => p.skipped += 1,
            }
        }
        if p.total > 0 {
            p.percent = (p.success + p.failed + p.skipped) as f32 * 100.0 / p.total as f32;
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepCondition;

    fn plan(spec: PlanSpec) -> TaskPlan {
        TaskPlan::from_spec(spec, &StepDefaults::default(), |_| DecisionKind::LocalStep)
    }

    fn a_then_b() -> TaskPlan {
        plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("open app").with_id("A"))
                .with_step(StepSpec::new("search X").with_id("B").after("A")),
        )
    }

    fn set(plan: &mut TaskPlan, id: &str, status: StepStatus) {
        plan.step_mut(id).unwrap().status = status;
    }

    #[test]
    fn test_validate_accepts_dag() {
        assert!(a_then_b().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        let unknown = plan(PlanSpec::new("p").with_step(StepSpec::new("x").with_id("A").after("Z")));
        assert!(matches!(unknown.validate(), Err(PlanError::InvalidDependency(_))));

        let own = plan(PlanSpec::new("p").with_step(StepSpec::new("x").with_id("A").after("A")));
        assert!(matches!(own.validate(), Err(PlanError::InvalidDependency(_))));

        let cycle = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("x").with_id("A").after("C"))
                .with_step(StepSpec::new("y").with_id("B").after("A"))
                .with_step(StepSpec::new("z").with_id("C").after("B")),
        );
        assert_eq!(
            cycle.validate(),
            Err(PlanError::InvalidDependency(
                "dependency cycle through A, B, C".to_string()
            ))
        );

        let dup = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("x").with_id("A"))
                .with_step(StepSpec::new("y").with_id("A")),
        );
        assert_eq!(dup.validate(), Err(PlanError::DuplicateStep("A".to_string())));

        assert_eq!(plan(PlanSpec::new("p")).validate(), Err(PlanError::EmptyPlan));
    }

    #[test]
    fn test_refresh_promotes_in_dependency_order() {
        let mut p = a_then_b();
        assert_eq!(p.refresh().ready, vec!["A".to_string()]);
        assert_eq!(p.step("B").unwrap().status, StepStatus::Pending);

        set(&mut p, "A", StepStatus::Success);
        assert_eq!(p.refresh().ready, vec!["B".to_string()]);
    }

    #[test]
    fn test_failure_cascades_skips() {
        let mut p = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("a").with_id("A"))
                .with_step(StepSpec::new("b").with_id("B").after("A"))
                .with_step(StepSpec::new("c").with_id("C").after("B"))
                .with_step(
                    StepSpec::new("recover")
                        .with_id("R")
                        .after("A")
                        .with_condition(StepCondition::OnFailure),
                ),
        );
        p.refresh();
        set(&mut p, "A", StepStatus::Failed);

        let promotion = p.refresh();
        assert_eq!(promotion.skipped, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(promotion.ready, vec!["R".to_string()]);
    }

    #[test]
    fn test_on_failure_root_step_becomes_ready() {
        let mut p = plan(PlanSpec::new("p").with_step(
            StepSpec::new("cleanup")
                .with_id("R")
                .with_condition(StepCondition::OnFailure),
        ));
        let promotion = p.refresh();
        assert_eq!(promotion.ready, vec!["R".to_string()]);
        assert!(promotion.skipped.is_empty());
    }

    #[test]
    fn test_stop_on_failure_skips_everything_queued() {
        let mut p = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("a").with_id("A"))
                .with_step(StepSpec::new("b").with_id("B"))
                .stop_on_failure(),
        );
        p.refresh();
        set(&mut p, "A", StepStatus::Failed);
        assert_eq!(p.refresh().skipped, vec!["B".to_string()]);
        assert_eq!(p.derive_status(), PlanStatus::Failed);
    }

    #[test]
    fn test_derive_status() {
        let mut p = a_then_b();
        p.refresh();
        assert_eq!(p.derive_status(), PlanStatus::Pending);

        set(&mut p, "A", StepStatus::Running);
        assert!(p.update_status());
        assert_eq!(p.status, PlanStatus::Running);
        assert!(p.started_at.is_some());

        set(&mut p, "A", StepStatus::Success);
        set(&mut p, "B", StepStatus::Success);
        p.update_status();
        assert_eq!(p.status, PlanStatus::Success);
        assert!(p.finished_at.is_some());
        assert_eq!(p.progress().percent, 100.0);
    }

    #[test]
    fn test_optional_failure_keeps_plan_successful() {
        let mut p = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("a").with_id("A"))
                .with_step(StepSpec::new("b").with_id("B").optional()),
        );
        set(&mut p, "A", StepStatus::Success);
        set(&mut p, "B", StepStatus::Failed);
        assert_eq!(p.derive_status(), PlanStatus::Success);

        p.cancelled = true;
        assert_eq!(p.derive_status(), PlanStatus::Cancelled);
    }

    #[test]
    fn test_paused_plan_reports_paused_until_finished() {
        let mut p = a_then_b();
        p.refresh();
        p.paused = true;
        assert!(p.update_status());
        assert_eq!(p.status, PlanStatus::Paused);
        assert!(p.started_at.is_none());

        set(&mut p, "A", StepStatus::Success);
        set(&mut p, "B", StepStatus::Success);
        p.update_status();
        assert_eq!(p.status, PlanStatus::Success);
    }

    #[test]
    fn test_retry_step_reopens_skipped_dependents() {
        let mut p = plan(
            PlanSpec::new("p")
                .with_step(StepSpec::new("a").with_id("A").with_max_retries(1))
                .with_step(StepSpec::new("b").with_id("B").after("A")),
        );
        p.refresh();
        set(&mut p, "A", StepStatus::Failed);
        p.refresh();
        p.update_status();
        assert_eq!(p.status, PlanStatus::Failed);
        assert_eq!(p.step("B").unwrap().status, StepStatus::Skipped);

        assert!(p.retry_step("A"));
        assert_eq!(p.step("A").unwrap().status, StepStatus::Ready);
        assert_eq!(p.step("A").unwrap().retry_count, 1);
        assert_eq!(p.step("B").unwrap().status, StepStatus::Pending);
        assert_eq!(p.status, PlanStatus::Pending);
        assert!(p.finished_at.is_none());

        // one retry allowed
        set(&mut p, "A", StepStatus::Failed);
        assert!(!p.retry_step("A"));
        assert!(!p.retry_step("B"));
        assert!(!p.retry_step("Z"));
    }

    #[test]
    fn test_reset_runs_plan_again() {
        let mut p = a_then_b();
        p.refresh();
        set(&mut p, "A", StepStatus::Success);
        set(&mut p, "B", StepStatus::Failed);
        p.cancelled = true;
        p.update_status();
        assert!(p.status.is_terminal());

        p.reset();
        assert_eq!(p.status, PlanStatus::Pending);
        assert!(!p.cancelled);
        assert!(p.finished_at.is_none());
        assert_eq!(p.step("A").unwrap().status, StepStatus::Ready);
        assert_eq!(p.step("B").unwrap().status, StepStatus::Pending);
    }
}
