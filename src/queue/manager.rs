//! The task queue: ordering, dispatch, leases, result reporting and history.
//!
//! Every mutating operation runs inside one `parking_lot::Mutex` critical
//! section, so dispatch calls from different device workers, scheduler fires
//! and intake never interleave. Store writes are snapshotted inside that
//! section and applied after it ends. Idle workers are woken through a shared
//! [`Notify`] whenever something may have become dispatchable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::decision::DecisionKind;
use crate::store::{StateStore, StoreError};
use crate::task::{
    ExecutionRecord, HistoryFilter, HistoryStats, PlanError, PlanProgress, PlanStatus, StepStatus,
    TaskPlan, TaskStep,
};

use super::lease::{CancelFlag, DeviceLease};
use super::persist::{PersistOp, Persister};

/// Queue errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),
    #[error("Unknown item: {0}")]
    UnknownItem(String),
    #[error("AlreadyReported: {0}")]
    AlreadyReported(String),
    #[error("Plan {0} has already finished")]
    PlanFinished(String),
    #[error("Plan {0} is still active")]
    PlanActive(String),
    #[error("Item {0} is not waiting in the queue")]
    NotQueued(String),
    #[error("Item {0} cannot be retried")]
    NotRetryable(String),
}

/// A dispatched step, handed to the device worker that will run it.
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub step_id: String,
    pub instruction: String,
    /// Device the run loop drives.
    pub device_id: String,
    /// Every device leased for this item (includes `device_id`).
    pub leased_devices: Vec<String>,
    pub priority: i32,
    pub decision: DecisionKind,
    pub max_retries: u32,
    pub timeout: Duration,
    pub max_steps: u32,
    pub cancel: CancelFlag,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item had not started and is now skipped.
    Skipped,
    /// The item is running; its run loop will stop at the next step.
    Signalled,
    /// The item already reached a terminal state.
    AlreadyFinished,
}

/// Point-in-time view of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSnapshot {
    pub id: String,
    pub name: String,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    /// Last action of a running step, if any.
    pub current_action: Option<String>,
    pub steps: Vec<TaskStep>,
}

impl PlanSnapshot {
    fn of(plan: &TaskPlan) -> Self {
        let current_action = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .find_map(|s| s.last_action.clone());

        Self {
            id: plan.id.clone(),
            name: plan.name.clone(),
            status: plan.status,
            progress: plan.progress(),
            current_action,
            steps: plan.steps.clone(),
        }
    }
}

/// What [`TaskQueueManager::restore_from`] brought back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub plans: usize,
    pub requeued: usize,
    pub records: usize,
}

/// Queue position of a not-yet-dispatched step.
#[derive(Debug, Clone)]
struct Entry {
    item_id: String,
    plan_id: String,
    step_id: String,
    priority: i32,
    seq: u64,
}

impl Entry {
    /// Higher priority first, then FIFO.
    fn sort_key(&self) -> (std::cmp::Reverse<i32>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

#[derive(Default)]
struct QueueState {
    plans: HashMap<String, TaskPlan>,
    entries: Vec<Entry>,
    running: HashMap<String, TaskItem>,
    leases: HashMap<String, DeviceLease>,
    reported: HashSet<String>,
    history: Vec<ExecutionRecord>,
    next_seq: u64,
    next_rev: u64,
}

impl QueueState {
    fn push_entry(&mut self, plan_id: &str, step_id: &str, priority: i32) {
        let entry = Entry {
            item_id: item_id(plan_id, step_id),
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.insert_entry(entry);
    }

    fn insert_entry(&mut self, entry: Entry) {
        let key = entry.sort_key();
        let pos = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(pos, entry);
    }

    /// Queue every queued step of a plan that has no entry yet.
    fn enqueue_plan_steps(&mut self, plan_id: &str) {
        let Some(plan) = self.plans.get(plan_id) else {
            return;
        };
        let missing: Vec<(String, i32)> = plan
            .steps
            .iter()
            .filter(|s| s.status.is_queued())
            .filter(|s| {
                let id = item_id(plan_id, &s.id);
                !self.entries.iter().any(|e| e.item_id == id)
            })
            .map(|s| (s.id.clone(), s.priority.unwrap_or(plan.priority)))
            .collect();
        for (step_id, priority) in missing {
            self.push_entry(plan_id, &step_id, priority);
        }
    }

    /// Drop queue entries of steps that are no longer queued.
    fn prune_entries(&mut self, plan_id: &str) {
        let Some(plan) = self.plans.get(plan_id) else {
            return;
        };
        self.entries.retain(|e| {
            e.plan_id != plan_id
                || plan
                    .step(&e.step_id)
                    .is_some_and(|s| s.status.is_queued())
        });
    }

    /// (plan id, step id) of `item_id`, whatever its state.
    fn locate(&self, item_id: &str) -> Option<(String, String)> {
        self.plans.values().find_map(|p| {
            p.steps
                .iter()
                .find(|s| self::item_id(&p.id, &s.id) == item_id)
                .map(|s| (p.id.clone(), s.id.clone()))
        })
    }

    /// Devices the step would lease when run on `device_id`.
    fn required_devices(step: &TaskStep, device_id: &str) -> Vec<String> {
        if step.devices.is_empty() {
            vec![device_id.to_string()]
        } else {
            step.devices.clone()
        }
    }

    /// Re-evaluate a plan after one of its steps changed.
    fn settle_plan(&mut self, plan_id: &str) {
        if let Some(plan) = self.plans.get_mut(plan_id) {
            let promotion = plan.refresh();
            if !promotion.skipped.is_empty() {
                tracing::info!(plan = plan_id, skipped = ?promotion.skipped, "Steps skipped");
            }
            if plan.update_status() {
                tracing::info!(plan = plan_id, status = ?plan.status, "Plan status changed");
            }
        }
        self.prune_entries(plan_id);
    }

    /// Skip queued steps and signal running ones. Returns (skipped, signalled).
    fn cancel_plan(&mut self, plan_id: &str) -> (usize, usize) {
        let Some(plan) = self.plans.get_mut(plan_id) else {
            return (0, 0);
        };
        if plan.status.is_terminal() {
            return (0, 0);
        }

        plan.cancelled = true;
        let mut skipped = 0;
        for step in plan.steps.iter_mut().filter(|s| s.status.is_queued()) {
            step.status = StepStatus::Skipped;
            step.error = Some("Cancelled".to_string());
            skipped += 1;
        }

        let mut signalled = 0;
        for item in self.running.values().filter(|i| i.plan_id == plan_id) {
            item.cancel.cancel();
            signalled += 1;
        }
        self.settle_plan(plan_id);
        tracing::info!(plan = plan_id, skipped, signalled, "Plan cancelled");
        (skipped, signalled)
    }

    fn next_rev(&mut self) -> u64 {
        self.next_rev += 1;
        self.next_rev
    }
}

/// Queue item id of a plan step.
pub fn item_id(plan_id: &str, step_id: &str) -> String {
    format!("{}/{}", plan_id, step_id)
}

/// Orders, dispatches and tracks task items across devices.
pub struct TaskQueueManager {
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    persister: Option<Persister>,
}

impl Default for TaskQueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueueManager {
    /// In-memory queue without persistence.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
            persister: None,
        }
    }

    /// Persist plans and records to `store` as they change.
    ///
    /// Writes run on tokio's blocking pool when called inside a runtime and
    /// inline otherwise; either way never under the queue lock.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.persister = Some(Persister::new(store));
        self
    }

    /// Wakes idle workers whenever the queue changes.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Wait until every pending store write has been applied.
    pub async fn flush(&self) {
        if let Some(persister) = &self.persister {
            persister.flush().await;
        }
    }

    /// Snapshot `plan_id` for the store. Call with the lock held.
    fn plan_op(&self, st: &mut QueueState, plan_id: &str) -> Option<PersistOp> {
        self.persister.as_ref()?;
        let plan = st.plans.get(plan_id)?.clone();
        Some(PersistOp::Plan {
            rev: st.next_rev(),
            plan,
        })
    }

    /// Hand snapshots to the store. Call after the lock is released.
    fn persist(&self, ops: impl IntoIterator<Item = PersistOp>) {
        if let Some(persister) = &self.persister {
            persister.submit(ops.into_iter().collect());
        }
    }

    /// Validate and enqueue a whole plan. Returns the plan id.
    pub fn submit_plan(&self, mut plan: TaskPlan) -> Result<String, QueueError> {
        plan.validate()?;

        let plan_id = plan.id.clone();
        let mut st = self.state.lock();
        if st.plans.contains_key(&plan_id) {
            return Err(QueueError::Plan(PlanError::DuplicateStep(format!(
                "plan {} already submitted",
                plan_id
            ))));
        }

        plan.refresh();
        plan.update_status();
        tracing::info!(
            plan = %plan_id,
            name = %plan.name,
            steps = plan.steps.len(),
            priority = plan.priority,
            "Plan submitted"
        );
        st.plans.insert(plan_id.clone(), plan);
        st.enqueue_plan_steps(&plan_id);

        let op = self.plan_op(&mut st, &plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(plan_id)
    }

    /// Append one step to `plan_id`, creating an ad-hoc plan when unknown.
    /// Returns the item id.
    pub fn enqueue(
        &self,
        plan_id: &str,
        step: TaskStep,
        priority: i32,
    ) -> Result<String, QueueError> {
        let mut st = self.state.lock();

        let plan = match st.plans.get(plan_id) {
            Some(existing) => {
                if existing.status.is_terminal() {
                    return Err(QueueError::PlanFinished(plan_id.to_string()));
                }
                let mut candidate = existing.clone();
                candidate.steps.push(step.clone());
                candidate
            }
            None => {
                let mut plan = TaskPlan::from_spec(
                    crate::task::PlanSpec::new(step.instruction.clone()).with_priority(priority),
                    &Default::default(),
                    |_| step.decision,
                );
                plan.id = plan_id.to_string();
                plan.steps = vec![step.clone()];
                plan
            }
        };
        plan.validate()?;

        let step_id = step.id.clone();
        st.plans.insert(plan_id.to_string(), plan);
        st.push_entry(plan_id, &step_id, priority);
        st.settle_plan(plan_id);
        tracing::info!(plan = plan_id, step = %step_id, priority, "Step enqueued");

        let op = self.plan_op(&mut st, plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(item_id(plan_id, &step_id))
    }

    /// Take the best ready item runnable on `device_id`, leasing its devices.
    /// Steps of paused plans are passed over.
    pub fn dispatch_ready(&self, device_id: &str) -> Option<TaskItem> {
        let mut st = self.state.lock();

        let (index, devices) = st.entries.iter().enumerate().find_map(|(i, e)| {
            let plan = st.plans.get(&e.plan_id)?;
            if plan.paused {
                return None;
            }
            let step = plan.step(&e.step_id)?;
            if step.status != StepStatus::Ready || !step.accepts_device(device_id) {
                return None;
            }
            let devices = QueueState::required_devices(step, device_id);
            if devices.iter().any(|d| st.leases.contains_key(d)) {
                return None;
            }
            Some((i, devices))
        })?;

        let entry = st.entries.remove(index);
        let now = Local::now();
        for device in &devices {
            st.leases.insert(
                device.clone(),
                DeviceLease {
                    device_id: device.clone(),
                    item_id: entry.item_id.clone(),
                    acquired_at: now,
                },
            );
        }

        let plan = st.plans.get_mut(&entry.plan_id)?;
        let plan_name = plan.name.clone();
        let step = plan.step_mut(&entry.step_id)?;
        step.status = StepStatus::Running;
        step.device_id = Some(device_id.to_string());
        step.steps_executed = 0;
        step.last_action = None;

        let item = TaskItem {
            id: entry.item_id.clone(),
            plan_id: entry.plan_id.clone(),
            plan_name,
            step_id: entry.step_id.clone(),
            instruction: step.instruction.clone(),
            device_id: device_id.to_string(),
            leased_devices: devices,
            priority: entry.priority,
            decision: step.decision,
            max_retries: step.max_retries,
            timeout: step.timeout(),
            max_steps: step.max_steps,
            cancel: CancelFlag::new(),
        };
        plan.update_status();

        tracing::info!(
            device = device_id,
            item = %item.id,
            leased = ?item.leased_devices,
            "Dispatched"
        );
        st.running.insert(item.id.clone(), item.clone());
        let op = self.plan_op(&mut st, &entry.plan_id);
        drop(st);
        self.persist(op);
        Some(item)
    }

    /// Record the outcome of a running item and release its leases.
    pub fn report_result(&self, item_id: &str, record: ExecutionRecord) -> Result<(), QueueError> {
        let mut st = self.state.lock();

        if st.reported.contains(item_id) {
            tracing::warn!(item = item_id, "Duplicate result rejected");
            return Err(QueueError::AlreadyReported(item_id.to_string()));
        }
        let item = st
            .running
            .remove(item_id)
            .ok_or_else(|| QueueError::UnknownItem(item_id.to_string()))?;

        st.leases.retain(|_, lease| lease.item_id != item_id);

        if let Some(step) = st
            .plans
            .get_mut(&item.plan_id)
            .and_then(|p| p.step_mut(&item.step_id))
        {
            step.status = if record.success {
                StepStatus::Success
            } else {
                StepStatus::Failed
            };
            step.steps_executed = record.steps_executed;
            step.error = record.error.clone();
        }
        st.settle_plan(&item.plan_id);

        tracing::info!(
            device = %record.device_id,
            item = item_id,
            status = ?record.status,
            success = record.success,
            "Result reported, lease released"
        );

        st.reported.insert(item_id.to_string());
        let mut ops = Vec::with_capacity(2);
        if self.persister.is_some() {
            ops.push(PersistOp::Record(record.clone()));
        }
        st.history.push(record);
        ops.extend(self.plan_op(&mut st, &item.plan_id));

        drop(st);
        self.persist(ops);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Cancel one item: queued → skipped, running → signalled.
    pub fn cancel(&self, item_id: &str) -> Result<CancelOutcome, QueueError> {
        let mut st = self.state.lock();

        if let Some(item) = st.running.get(item_id) {
            item.cancel.cancel();
            tracing::info!(item = item_id, "Cancellation signalled");
            return Ok(CancelOutcome::Signalled);
        }

        let Some(entry) = st.entries.iter().find(|e| e.item_id == item_id).cloned() else {
            if st.reported.contains(item_id) || self.is_terminal_step(&st, item_id) {
                return Ok(CancelOutcome::AlreadyFinished);
            }
            return Err(QueueError::UnknownItem(item_id.to_string()));
        };

        if let Some(step) = st
            .plans
            .get_mut(&entry.plan_id)
            .and_then(|p| p.step_mut(&entry.step_id))
        {
            step.status = StepStatus::Skipped;
            step.error = Some("Cancelled".to_string());
        }
        st.settle_plan(&entry.plan_id);
        tracing::info!(item = item_id, "Queued item cancelled");

        let op = self.plan_op(&mut st, &entry.plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(CancelOutcome::Skipped)
    }

    fn is_terminal_step(&self, st: &QueueState, item_id: &str) -> bool {
        st.locate(item_id).is_some_and(|(plan_id, step_id)| {
            st.plans
                .get(&plan_id)
                .and_then(|p| p.step(&step_id))
                .is_some_and(|s| s.status.is_terminal())
        })
    }

    /// Cancel every queued and running step of a plan.
    /// Returns (skipped, signalled) counts.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<(usize, usize), QueueError> {
        let mut st = self.state.lock();
        if !st.plans.contains_key(plan_id) {
            return Err(QueueError::UnknownPlan(plan_id.to_string()));
        }
        let counts = st.cancel_plan(plan_id);

        let op = self.plan_op(&mut st, plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(counts)
    }

    /// Cancel every plan that has not finished.
    /// Returns (skipped, signalled) totals.
    pub fn cancel_all(&self) -> (usize, usize) {
        let mut st = self.state.lock();
        let active: Vec<String> = st
            .plans
            .values()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id.clone())
            .collect();

        let mut totals = (0, 0);
        let mut ops = Vec::new();
        for plan_id in &active {
            let (skipped, signalled) = st.cancel_plan(plan_id);
            totals.0 += skipped;
            totals.1 += signalled;
            ops.extend(self.plan_op(&mut st, plan_id));
        }
        tracing::info!(
            plans = active.len(),
            skipped = totals.0,
            signalled = totals.1,
            "All plans cancelled"
        );

        drop(st);
        self.persist(ops);
        self.notify.notify_waiters();
        totals
    }

    /// Put a failed item back in the queue, up to its step's `max_retries`.
    ///
    /// Dependents its failure skipped are reconsidered as well.
    pub fn retry(&self, item_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let (plan_id, step_id) = st
            .locate(item_id)
            .ok_or_else(|| QueueError::UnknownItem(item_id.to_string()))?;

        let plan = st
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| QueueError::UnknownPlan(plan_id.clone()))?;
        if plan.cancelled || !plan.retry_step(&step_id) {
            return Err(QueueError::NotRetryable(item_id.to_string()));
        }
        let attempt = plan.step(&step_id).map(|s| s.retry_count).unwrap_or_default();

        st.reported.remove(item_id);
        st.enqueue_plan_steps(&plan_id);
        st.settle_plan(&plan_id);
        tracing::info!(item = item_id, attempt, "Item queued for retry");

        let op = self.plan_op(&mut st, &plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Move a queued item to `priority`, keeping its FIFO position among
    /// items of equal priority.
    pub fn set_priority(&self, item_id: &str, priority: i32) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let Some(index) = st.entries.iter().position(|e| e.item_id == item_id) else {
            return Err(match st.locate(item_id) {
                Some(_) => QueueError::NotQueued(item_id.to_string()),
                None => QueueError::UnknownItem(item_id.to_string()),
            });
        };

        let mut entry = st.entries.remove(index);
        entry.priority = priority;
        let plan_id = entry.plan_id.clone();
        if let Some(step) = st
            .plans
            .get_mut(&plan_id)
            .and_then(|p| p.step_mut(&entry.step_id))
        {
            step.priority = Some(priority);
        }
        st.insert_entry(entry);
        tracing::info!(item = item_id, priority, "Priority changed");

        let op = self.plan_op(&mut st, &plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stop dispatching a plan's steps. Running steps finish normally.
    pub fn pause_plan(&self, plan_id: &str) -> Result<(), QueueError> {
        self.set_paused(plan_id, true)
    }

    pub fn resume_plan(&self, plan_id: &str) -> Result<(), QueueError> {
        self.set_paused(plan_id, false)
    }

    fn set_paused(&self, plan_id: &str, paused: bool) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let plan = st
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| QueueError::UnknownPlan(plan_id.to_string()))?;
        if plan.status.is_terminal() {
            return Err(QueueError::PlanFinished(plan_id.to_string()));
        }
        if plan.paused == paused {
            return Ok(());
        }

        plan.paused = paused;
        plan.update_status();
        tracing::info!(plan = plan_id, paused, "Plan dispatch toggled");

        let op = self.plan_op(&mut st, plan_id);
        drop(st);
        self.persist(op);
        if !paused {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Run a finished plan again from the start.
    pub fn reset_plan(&self, plan_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let plan = st
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| QueueError::UnknownPlan(plan_id.to_string()))?;
        if !plan.status.is_terminal() {
            return Err(QueueError::PlanActive(plan_id.to_string()));
        }

        plan.reset();
        let items: Vec<String> = plan.steps.iter().map(|s| item_id(plan_id, &s.id)).collect();
        for id in &items {
            st.reported.remove(id);
        }
        st.enqueue_plan_steps(plan_id);
        st.settle_plan(plan_id);
        tracing::info!(plan = plan_id, steps = items.len(), "Plan reset");

        let op = self.plan_op(&mut st, plan_id);
        drop(st);
        self.persist(op);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Forget a plan that has nothing running. Its history stays.
    pub fn delete_plan(&self, plan_id: &str) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        if !st.plans.contains_key(plan_id) {
            return Err(QueueError::UnknownPlan(plan_id.to_string()));
        }
        if st.running.values().any(|i| i.plan_id == plan_id) {
            return Err(QueueError::PlanActive(plan_id.to_string()));
        }

        st.plans.remove(plan_id);
        st.entries.retain(|e| e.plan_id != plan_id);
        let prefix = item_id(plan_id, "");
        st.reported.retain(|id| !id.starts_with(&prefix));
        tracing::info!(plan = plan_id, "Plan deleted");

        let op = self.persister.as_ref().map(|_| PersistOp::DeletePlan {
            rev: st.next_rev(),
            plan_id: plan_id.to_string(),
        });
        drop(st);
        self.persist(op);
        Ok(())
    }

    /// Publish mid-run progress of a running item.
    pub fn update_progress(
        &self,
        item_id: &str,
        steps_executed: u32,
        last_action: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        let (plan_id, step_id) = st
            .running
            .get(item_id)
            .map(|i| (i.plan_id.clone(), i.step_id.clone()))
            .ok_or_else(|| QueueError::UnknownItem(item_id.to_string()))?;

        if let Some(step) = st.plans.get_mut(&plan_id).and_then(|p| p.step_mut(&step_id)) {
            step.steps_executed = steps_executed;
            if let Some(action) = last_action {
                step.last_action = Some(action.to_string());
            }
        }
        Ok(())
    }

    pub fn plan_status(&self, plan_id: &str) -> Option<PlanSnapshot> {
        self.state.lock().plans.get(plan_id).map(PlanSnapshot::of)
    }

    /// Snapshots of every plan, oldest first.
    pub fn plans(&self) -> Vec<PlanSnapshot> {
        let st = self.state.lock();
        let mut plans: Vec<&TaskPlan> = st.plans.values().collect();
        plans.sort_by_key(|p| p.created_at);
        plans.into_iter().map(PlanSnapshot::of).collect()
    }

    /// Plan id owning `item_id`, whether queued, running or finished.
    pub fn plan_of_item(&self, item_id: &str) -> Option<String> {
        self.state.lock().locate(item_id).map(|(plan_id, _)| plan_id)
    }

    pub fn leases(&self) -> Vec<DeviceLease> {
        let mut leases: Vec<DeviceLease> = self.state.lock().leases.values().cloned().collect();
        leases.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        leases
    }

    /// Number of items currently running.
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Number of queued (not yet dispatched) items.
    pub fn queued_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn history(&self, filter: &HistoryFilter) -> Vec<ExecutionRecord> {
        let st = self.state.lock();
        filter.apply(&st.history).into_iter().cloned().collect()
    }

    pub fn history_stats(&self, filter: &HistoryFilter) -> HistoryStats {
        let st = self.state.lock();
        HistoryStats::from_records(filter.apply(&st.history))
    }

    /// Drop records that started before `before`. Returns how many went.
    pub fn purge_history(&self, before: DateTime<Local>) -> usize {
        let mut st = self.state.lock();
        let len = st.history.len();
        st.history.retain(|r| r.started_at >= before);
        let removed = len - st.history.len();
        drop(st);

        self.persist(self.persister.as_ref().map(|_| PersistOp::Purge(before)));
        tracing::info!(removed, "History purged");
        removed
    }

    /// Reload plans and history from `store`.
    ///
    /// Steps that were running when the state was saved go back to pending;
    /// their runs are lost and they will be dispatched again.
    pub fn restore_from(&self, store: &dyn StateStore) -> Result<RestoreSummary, StoreError> {
        let mut plans = store.load_plans()?;
        let mut records = store.load_records()?;
        let mut summary = RestoreSummary {
            plans: plans.len(),
            records: records.len(),
            ..Default::default()
        };
        plans.sort_by_key(|p| p.created_at);
        // Blocking-pool appends may land out of order.
        records.sort_by_key(|r| r.started_at);

        let mut st = self.state.lock();
        for mut plan in plans {
            for step in plan.steps.iter_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Pending;
                    step.device_id = None;
                    summary.requeued += 1;
                }
            }
            plan.refresh();
            plan.update_status();

            let plan_id = plan.id.clone();
            st.plans.insert(plan_id.clone(), plan);
            st.enqueue_plan_steps(&plan_id);
        }

        // A step queued again after its record (retry, reset) may report anew.
        let finished: Vec<String> = records
            .iter()
            .filter(|r| st.locate(&r.item_id).is_none() || self.is_terminal_step(&st, &r.item_id))
            .map(|r| r.item_id.clone())
            .collect();
        st.reported.extend(finished);
        st.history = records;
        drop(st);

        tracing::info!(
            plans = summary.plans,
            requeued = summary.requeued,
            records = summary.records,
            "Queue state restored"
        );
        self.notify.notify_waiters();
        Ok(summary)
    }
}
