//! The transport half of one observe-decide-act cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

use crate::transport::{DeviceTransport, Screenshot, TransportError};

/// Outcome of [`StepExecutor::execute`].
#[derive(Debug, Clone)]
pub struct StepReport {
    pub success: bool,
    /// Screen after the settle delay; set on success.
    pub screenshot: Option<Screenshot>,
    pub elapsed: Duration,
    pub error: Option<TransportError>,
    /// Whether the instruction itself went through. A report can be applied
    /// yet unsuccessful when only the follow-up capture failed.
    pub applied: bool,
    /// Transport acknowledgement text.
    pub message: Option<String>,
}

impl StepReport {
    fn failed(started: Instant, error: TransportError, applied: bool) -> Self {
        Self {
            success: false,
            screenshot: None,
            elapsed: started.elapsed(),
            error: Some(error),
            applied,
            message: None,
        }
    }
}

/// Applies instructions and captures screens through a [`DeviceTransport`],
/// with a deadline on every transport call.
#[derive(Clone)]
pub struct StepExecutor {
    transport: Arc<dyn DeviceTransport>,
}

impl StepExecutor {
    pub fn new(transport: Arc<dyn DeviceTransport>) -> Self {
        Self { transport }
    }

    /// Capture the current screen, giving up after `limit`.
    pub async fn capture(&self, device_id: &str, limit: Duration) -> Result<Screenshot, TransportError> {
        match timeout(limit, self.transport.capture_screenshot(device_id)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::DeviceUnreachable(format!(
                "screenshot of {} timed out after {:.1}s",
                device_id,
                limit.as_secs_f64()
            ))),
        }
    }

    /// Apply `instruction`, wait `wait_after`, then capture the new screen.
    pub async fn execute(
        &self,
        device_id: &str,
        instruction: &str,
        wait_after: Duration,
        limit: Duration,
    ) -> StepReport {
        let started = Instant::now();

        let ack = match timeout(limit, self.transport.apply_instruction(device_id, instruction)).await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                tracing::warn!(device = device_id, instruction, "Instruction failed: {}", e);
                return StepReport::failed(started, e, false);
            }
            Err(_) => {
                let e = TransportError::DeviceUnreachable(format!(
                    "no answer within {:.1}s",
                    limit.as_secs_f64()
                ));
                tracing::warn!(device = device_id, instruction, "Instruction timed out");
                return StepReport::failed(started, e, false);
            }
        };

        if !wait_after.is_zero() {
            sleep(wait_after).await;
        }

        match self.capture(device_id, limit).await {
            Ok(screenshot) => StepReport {
                success: true,
                screenshot: Some(screenshot),
                elapsed: started.elapsed(),
                error: None,
                applied: true,
                message: ack.message,
            },
            Err(e) => {
                tracing::warn!(device = device_id, "Capture after action failed: {}", e);
                StepReport::failed(started, e, true)
            }
        }
    }
}
