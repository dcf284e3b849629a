//! [`DeviceTransport`] over the local `adb` binary.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::actions::{parse_action, Action, ActionHandler, HandlerError};
use crate::adb::{self, AdbClient, AdbError};

use super::{ActionAck, DeviceTransport, Screenshot, TransportError};

const DEFAULT_SCREEN: (u32, u32) = (1080, 2400);

/// ADB-backed transport.
///
/// Instructions are `do(...)` / `finish(...)` strings. The screen size used
/// for relative coordinates is taken from the last capture of each device.
pub struct AdbTransport {
    handler: ActionHandler,
    screen_sizes: Mutex<HashMap<String, (u32, u32)>>,
}

impl AdbTransport {
    pub fn new(adb: AdbClient) -> Self {
        Self {
            handler: ActionHandler::new(adb),
            screen_sizes: Mutex::new(HashMap::new()),
        }
    }

    fn screen_size(&self, device_id: &str) -> (u32, u32) {
        self.screen_sizes
            .lock()
            .get(device_id)
            .copied()
            .unwrap_or(DEFAULT_SCREEN)
    }
}

impl Default for AdbTransport {
    fn default() -> Self {
        Self::new(AdbClient::new())
    }
}

fn map_adb_error(err: AdbError) -> TransportError {
    match err {
        AdbError::CommandFailed(msg) => TransportError::ActionRejected(msg),
        other => TransportError::DeviceUnreachable(other.to_string()),
    }
}

#[async_trait]
impl DeviceTransport for AdbTransport {
    async fn capture_screenshot(&self, device_id: &str) -> Result<Screenshot, TransportError> {
        let shot = adb::get_screenshot(self.handler.adb(), device_id)
            .await
            .map_err(|e| TransportError::DeviceUnreachable(e.to_string()))?;

        if !shot.is_sensitive {
            self.screen_sizes
                .lock()
                .insert(device_id.to_string(), (shot.width, shot.height));
        }
        Ok(shot)
    }

    async fn apply_instruction(
        &self,
        device_id: &str,
        instruction: &str,
    ) -> Result<ActionAck, TransportError> {
        let action = parse_action(instruction)
            .map_err(|e| TransportError::ActionRejected(e.to_string()))?;

        // Settling is done by the step executor after every action.
        if let Action::Wait { .. } = action {
            return Ok(ActionAck::default());
        }

        let (width, height) = self.screen_size(device_id);
        tracing::debug!(device = device_id, action = action.name(), "Applying action");

        match self.handler.execute(device_id, &action, width, height).await {
            Ok(result) => Ok(ActionAck {
                message: result.message,
            }),
            Err(HandlerError::Rejected(msg)) => Err(TransportError::ActionRejected(msg)),
            Err(HandlerError::Adb(err)) => Err(map_adb_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_transport() -> AdbTransport {
        AdbTransport::new(AdbClient::new().with_path("/nonexistent/adb-binary"))
    }

    #[tokio::test]
    async fn test_free_text_instruction_is_rejected() {
        let transport = offline_transport();
        let err = transport
            .apply_instruction("d1", "open the settings app")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ActionRejected");
    }

    #[tokio::test]
    async fn test_missing_adb_is_unreachable() {
        let transport = offline_transport();
        let err = transport
            .apply_instruction("d1", r#"do(action="Home")"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DeviceUnreachable");

        let err = transport.capture_screenshot("d1").await.unwrap_err();
        assert_eq!(err.code(), "DeviceUnreachable");
    }

    #[tokio::test]
    async fn test_wait_and_finish_need_no_device() {
        let transport = offline_transport();
        assert!(transport
            .apply_instruction("d1", r#"do(action="Wait", duration="2 seconds")"#)
            .await
            .is_ok());
        let ack = transport
            .apply_instruction("d1", r#"finish(message="ok")"#)
            .await
            .unwrap();
        assert_eq!(ack.message.as_deref(), Some("ok"));
    }

    #[test]
    fn test_default_screen_size() {
        assert_eq!(offline_transport().screen_size("unknown"), DEFAULT_SCREEN);
    }
}
