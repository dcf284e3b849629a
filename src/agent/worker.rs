//! One long-lived task per device, pulling work from the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::run_loop::AgentRunLoop;
use crate::queue::TaskQueueManager;

/// Fallback poll period when no queue notification arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct DeviceWorker {
    device_id: String,
    queue: Arc<TaskQueueManager>,
    run_loop: Arc<AgentRunLoop>,
    poll_interval: Duration,
}

impl DeviceWorker {
    pub fn new(
        device_id: impl Into<String>,
        queue: Arc<TaskQueueManager>,
        run_loop: Arc<AgentRunLoop>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            queue,
            run_loop,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Dispatch and run items until `shutdown` turns true.
    /// A running item is always finished before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let notify = self.queue.notifier();
        tracing::info!(device = %self.device_id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register interest before looking, so a change made between the
            // dispatch attempt and the wait still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.queue.dispatch_ready(&self.device_id) {
                let record = self.run_loop.run(item).await;
                tracing::debug!(
                    device = %self.device_id,
                    item = %record.item_id,
                    success = record.success,
                    "Worker finished item"
                );
                continue;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut notified => {}
                _ = sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(device = %self.device_id, "Worker stopped");
    }
}

/// Running device workers.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Spawn one worker per device.
    pub fn spawn(
        devices: &[String],
        queue: Arc<TaskQueueManager>,
        run_loop: Arc<AgentRunLoop>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handles = devices
            .iter()
            .map(|device| {
                let worker = DeviceWorker::new(device.clone(), queue.clone(), run_loop.clone())
                    .with_poll_interval(poll_interval);
                (device.clone(), tokio::spawn(worker.run(rx.clone())))
            })
            .collect();

        Self { shutdown, handles }
    }

    pub fn devices(&self) -> Vec<String> {
        self.handles.iter().map(|(d, _)| d.clone()).collect()
    }

    /// Receiver that flips with this pool's shutdown, for companion loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every worker to stop and wait for them.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (device, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(device = %device, "Worker task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::agent::{RunLoopConfig, StepExecutor};
    use crate::decision::{
        ActionDecision, DecisionBackend, DecisionContext, DecisionError, DecisionKind,
        DecisionRouter,
    };
    use crate::task::{HistoryFilter, PlanSpec, PlanStatus, StepDefaults, TaskPlan};
    use crate::testing::{FakeTransport, ScriptedBackend};

    fn pool(devices: &[&str], script: Vec<ActionDecision>) -> (Arc<TaskQueueManager>, WorkerPool) {
        let queue = Arc::new(TaskQueueManager::new());
        let backend = ScriptedBackend::new(script.into_iter().map(Ok).collect());
        let run_loop = Arc::new(AgentRunLoop::new(
            StepExecutor::new(Arc::new(FakeTransport::new())),
            DecisionRouter::new(Arc::new(backend)),
            queue.clone(),
            RunLoopConfig::default(),
        ));
        let devices: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
        let pool = WorkerPool::spawn(&devices, queue.clone(), run_loop, Duration::from_millis(20));
        (queue, pool)
    }

    fn submit(queue: &TaskQueueManager, instruction: &str) -> String {
        let plan = TaskPlan::from_spec(
            PlanSpec::single(instruction),
            &StepDefaults::default(),
            |_| DecisionKind::LocalStep,
        );
        queue.submit_plan(plan).unwrap()
    }

    async fn wait_for(queue: &TaskQueueManager, plan_id: &str) -> PlanStatus {
        for _ in 0..200 {
            let status = queue.plan_status(plan_id).unwrap().status;
            if status.is_terminal() {
                return status;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("plan {} did not finish", plan_id);
    }

    #[tokio::test]
    async fn test_worker_picks_up_submitted_plan() {
        let (queue, pool) = pool(&["D1"], vec![ActionDecision::complete("done")]);
        let plan_id = submit(&queue, "打开设置");

        assert_eq!(wait_for(&queue, &plan_id).await, PlanStatus::Success);
        pool.stop().await;
        assert_eq!(queue.history(&HistoryFilter::device("D1")).len(), 1);
    }

    /// Acts twice with the item id as the instruction, then completes.
    #[derive(Default)]
    struct ItemEchoBackend {
        calls: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl DecisionBackend for ItemEchoBackend {
        fn kind(&self) -> DecisionKind {
            DecisionKind::LocalStep
        }

        async fn next_action(
            &self,
            ctx: &DecisionContext<'_>,
        ) -> Result<ActionDecision, DecisionError> {
            let mut calls = self.calls.lock();
            let n = calls.entry(ctx.item_id.to_string()).or_default();
            *n += 1;
            if *n > 2 {
                Ok(ActionDecision::complete("done"))
            } else {
                Ok(ActionDecision::act(ctx.item_id, 0.0))
            }
        }
    }

    #[tokio::test]
    async fn test_items_never_interleave_on_a_device() {
        let queue = Arc::new(TaskQueueManager::new());
        let transport = Arc::new(FakeTransport::new().with_apply_delay(Duration::from_millis(5)));
        let run_loop = Arc::new(AgentRunLoop::new(
            StepExecutor::new(transport.clone()),
            DecisionRouter::new(Arc::new(ItemEchoBackend::default())),
            queue.clone(),
            RunLoopConfig::default(),
        ));
        let devices = vec!["D1".to_string(), "D2".to_string()];
        let pool = WorkerPool::spawn(&devices, queue.clone(), run_loop, Duration::from_millis(20));

        let plans: Vec<String> = (0..6).map(|i| submit(&queue, &format!("task {}", i))).collect();
        for plan_id in &plans {
            assert_eq!(wait_for(&queue, plan_id).await, PlanStatus::Success);
        }
        pool.stop().await;

        let applied = transport.applied();
        assert_eq!(applied.len(), 12);
        for device in &devices {
            // consecutive runs of the same item on this device
            let mut runs: Vec<&str> = Vec::new();
            for (_, item) in applied.iter().filter(|(d, _)| d == device) {
                if runs.last() != Some(&item.as_str()) {
                    runs.push(item);
                }
            }
            let distinct: HashSet<&str> = runs.iter().copied().collect();
            assert_eq!(distinct.len(), runs.len(), "items interleaved on {}: {:?}", device, runs);
        }
        // each item ran entirely on one device
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for (device, item) in &applied {
            assert_eq!(*owner.entry(item).or_insert(device), device.as_str());
        }
        assert_eq!(queue.history(&HistoryFilter::default()).len(), 6);
    }

    #[tokio::test]
    async fn test_stop_with_no_work() {
        let (_, pool) = pool(&["D1", "D2"], vec![]);
        assert_eq!(pool.devices(), vec!["D1".to_string(), "D2".to_string()]);
        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .unwrap();
    }
}
