//! Store writes taken off the queue lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::store::{StateStore, StoreError};
use crate::task::{ExecutionRecord, TaskPlan};

/// One store write, captured while the queue lock is held.
#[derive(Debug)]
pub(super) enum PersistOp {
    Plan { rev: u64, plan: TaskPlan },
    DeletePlan { rev: u64, plan_id: String },
    Record(ExecutionRecord),
    Purge(DateTime<Local>),
}

/// Applies [`PersistOp`]s on the blocking pool, or inline without a runtime.
///
/// Plan writes carry the revision they were taken at. A write older than the
/// last one applied to the same plan is dropped, so a late blocking task can
/// never roll a plan back or bring a deleted one back.
pub(super) struct Persister {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    // plan id -> last applied revision; held while that write runs
    applied: Mutex<HashMap<String, u64>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Persister {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                applied: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn submit(&self, ops: Vec<PersistOp>) {
        if ops.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                handle.spawn_blocking(move || {
                    inner.apply(ops);
                    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        inner.idle.notify_waiters();
                    }
                });
            }
            Err(_) => self.inner.apply(ops),
        }
    }

    /// Wait until every submitted write has reached the store.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn apply(&self, ops: Vec<PersistOp>) {
        for op in ops {
            match op {
                PersistOp::Plan { rev, plan } => {
                    let result = self.ordered(&plan.id, rev, || self.store.save_plan(&plan));
                    if let Err(e) = result {
                        tracing::warn!(plan = %plan.id, "Failed to persist plan: {}", e);
                    }
                }
                PersistOp::DeletePlan { rev, plan_id } => {
                    let result = self.ordered(&plan_id, rev, || self.store.delete_plan(&plan_id));
                    if let Err(e) = result {
                        tracing::warn!(plan = %plan_id, "Failed to delete persisted plan: {}", e);
                    }
                }
                PersistOp::Record(record) => {
                    if let Err(e) = self.store.append_record(&record) {
                        tracing::warn!(item = %record.item_id, "Failed to persist record: {}", e);
                    }
                }
                PersistOp::Purge(before) => {
                    if let Err(e) = self.store.purge_records(before) {
                        tracing::warn!("Failed to purge persisted records: {}", e);
                    }
                }
            }
        }
    }

    /// Run `write` unless a newer revision of `plan_id` already landed.
    fn ordered(
        &self,
        plan_id: &str,
        rev: u64,
        write: impl FnOnce() -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut applied = self.applied.lock();
        if applied.get(plan_id).is_some_and(|last| *last >= rev) {
            tracing::trace!(plan = plan_id, rev, "Dropping stale plan write");
            return Ok(());
        }
        applied.insert(plan_id.to_string(), rev);
        write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionKind;
    use crate::store::MemoryStore;
    use crate::task::{PlanSpec, StepDefaults};

    fn plan(name: &str) -> TaskPlan {
        TaskPlan::from_spec(
            PlanSpec::single(name),
            &StepDefaults::default(),
            |_| DecisionKind::LocalStep,
        )
    }

    #[test]
    fn test_stale_revision_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::new(store.clone());
        let mut newer = plan("first");
        let older = newer.clone();
        newer.name = "renamed".to_string();

        persister.submit(vec![PersistOp::Plan { rev: 2, plan: newer }]);
        persister.submit(vec![PersistOp::Plan { rev: 1, plan: older }]);
        assert_eq!(store.load_plans().unwrap()[0].name, "renamed");
    }

    #[test]
    fn test_delete_is_not_undone_by_late_save() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::new(store.clone());
        let p = plan("gone");

        persister.submit(vec![PersistOp::Plan { rev: 1, plan: p.clone() }]);
        persister.submit(vec![PersistOp::DeletePlan {
            rev: 3,
            plan_id: p.id.clone(),
        }]);
        persister.submit(vec![PersistOp::Plan { rev: 2, plan: p }]);
        assert!(store.load_plans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_waits_for_blocking_writes() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::new(store.clone());
        for rev in 1..=5 {
            persister.submit(vec![PersistOp::Plan {
                rev,
                plan: plan(&format!("p{}", rev)),
            }]);
        }
        persister.flush().await;
        assert_eq!(store.load_plans().unwrap().len(), 5);
    }
}
