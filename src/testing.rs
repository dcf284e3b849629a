//! Scripted fakes for the transport and decision seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::decision::{ActionDecision, DecisionBackend, DecisionContext, DecisionError, DecisionKind};
use crate::transport::{ActionAck, DeviceTransport, Screenshot, TransportError};

pub(crate) fn screenshot() -> Screenshot {
    Screenshot::new("iVBORw0KGgo=".to_string(), 1080, 2400, false)
}

/// Transport that answers from scripts, then succeeds.
#[derive(Default)]
pub(crate) struct FakeTransport {
    apply_script: Mutex<VecDeque<Result<ActionAck, TransportError>>>,
    capture_script: Mutex<VecDeque<Result<Screenshot, TransportError>>>,
    apply_delay: Duration,
    applied: Mutex<Vec<(String, String)>>,
    captures: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_apply_results(self, results: Vec<Result<ActionAck, TransportError>>) -> Self {
        *self.apply_script.lock() = results.into();
        self
    }

    pub(crate) fn with_capture_results(
        self,
        results: Vec<Result<Screenshot, TransportError>>,
    ) -> Self {
        *self.capture_script.lock() = results.into();
        self
    }

    pub(crate) fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// (device, instruction) pairs, in order.
    pub(crate) fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().clone()
    }

    pub(crate) fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceTransport for FakeTransport {
    async fn capture_screenshot(&self, _device_id: &str) -> Result<Screenshot, TransportError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let scripted = self.capture_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(screenshot()))
    }

    async fn apply_instruction(
        &self,
        device_id: &str,
        instruction: &str,
    ) -> Result<ActionAck, TransportError> {
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let scripted = self.apply_script.lock().pop_front();
        let result = scripted.unwrap_or_else(|| Ok(ActionAck::default()));
        if result.is_ok() {
            self.applied
                .lock()
                .push((device_id.to_string(), instruction.to_string()));
        }
        result
    }
}

/// Backend that replays a script, then keeps pressing Back.
pub(crate) struct ScriptedBackend {
    kind: DecisionKind,
    script: Mutex<VecDeque<Result<ActionDecision, DecisionError>>>,
    delay: Duration,
    calls: AtomicUsize,
    finished: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn new(script: Vec<Result<ActionDecision, DecisionError>>) -> Self {
        Self {
            kind: DecisionKind::LocalStep,
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_kind(mut self, kind: DecisionKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Item ids passed to `finish_run`.
    pub(crate) fn finished_runs(&self) -> Vec<String> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl DecisionBackend for ScriptedBackend {
    fn kind(&self) -> DecisionKind {
        self.kind
    }

    async fn next_action(&self, _ctx: &DecisionContext<'_>) -> Result<ActionDecision, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(ActionDecision::act(r#"do(action="Back")"#, 0.0)))
    }

    async fn finish_run(&self, item_id: &str, _device_id: &str) {
        self.finished.lock().push(item_id.to_string());
    }
}
