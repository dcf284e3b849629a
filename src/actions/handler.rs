//! Executes parsed [`Action`]s on a device over ADB.

use std::time::Duration;

use thiserror::Error;

use crate::adb::{self, AdbClient, AdbError};

use super::parser::{Action, RelativePoint};

/// Action execution errors.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The action is well-formed but cannot be applied on this device.
    #[error("Action rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Adb(#[from] AdbError),
}

/// Result of an executed action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub should_finish: bool,
    pub message: Option<String>,
}

impl ActionResult {
    fn done() -> Self {
        Self {
            should_finish: false,
            message: None,
        }
    }

    fn with_message(message: impl Into<String>) -> Self {
        Self {
            should_finish: false,
            message: Some(message.into()),
        }
    }
}

/// Upper bound of the model's relative coordinate space (exclusive).
pub const RELATIVE_SCALE: i64 = 1000;

/// Map a 0..=999 point onto a `width` x `height` screen.
pub fn to_absolute(
    point: RelativePoint,
    screen_width: u32,
    screen_height: u32,
) -> Result<(i32, i32), HandlerError> {
    let (rx, ry) = point;
    if !(0..RELATIVE_SCALE).contains(&rx) || !(0..RELATIVE_SCALE).contains(&ry) {
        return Err(HandlerError::Rejected(format!(
            "Coordinate [{}, {}] is outside [0, {})",
            rx, ry, RELATIVE_SCALE
        )));
    }
    let x = rx * screen_width as i64 / RELATIVE_SCALE;
    let y = ry * screen_height as i64 / RELATIVE_SCALE;
    Ok((x as i32, y as i32))
}

/// Handles execution of actions on one ADB endpoint.
#[derive(Debug, Clone, Default)]
pub struct ActionHandler {
    adb: AdbClient,
}

impl ActionHandler {
    /// Create a handler over `adb`.
    pub fn new(adb: AdbClient) -> Self {
        Self { adb }
    }

    /// The underlying ADB runner.
    pub fn adb(&self) -> &AdbClient {
        &self.adb
    }

    /// Execute `action` on `device_id` whose screen is `screen_width` x `screen_height`.
    pub async fn execute(
        &self,
        device_id: &str,
        action: &Action,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<ActionResult, HandlerError> {
        let abs = |p: RelativePoint| to_absolute(p, screen_width, screen_height);

        match action {
            Action::Launch { app } => {
                if adb::launch_app(&self.adb, device_id, app).await? {
                    Ok(ActionResult::with_message(format!("Launched {}", app)))
                } else {
                    Err(HandlerError::Rejected(format!("App not found: {}", app)))
                }
            }
            Action::Tap { element } => {
                let (x, y) = abs(*element)?;
                adb::tap(&self.adb, device_id, x, y).await?;
                Ok(ActionResult::done())
            }
            Action::Type { text } => {
                adb::type_text_with_keyboard_handling(&self.adb, device_id, text).await?;
                Ok(ActionResult::done())
            }
            Action::Swipe { start, end } => {
                let (start, end) = (abs(*start)?, abs(*end)?);
                adb::swipe(&self.adb, device_id, start, end, None).await?;
                Ok(ActionResult::done())
            }
            Action::Back => {
                adb::back(&self.adb, device_id).await?;
                Ok(ActionResult::done())
            }
            Action::Home => {
                adb::home(&self.adb, device_id).await?;
                Ok(ActionResult::done())
            }
            Action::DoubleTap { element } => {
                let (x, y) = abs(*element)?;
                adb::double_tap(&self.adb, device_id, x, y).await?;
                Ok(ActionResult::done())
            }
            Action::LongPress { element } => {
                let (x, y) = abs(*element)?;
                adb::long_press(&self.adb, device_id, x, y, None).await?;
                Ok(ActionResult::done())
            }
            Action::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                Ok(ActionResult::done())
            }
            Action::TakeOver { message } => Err(HandlerError::Rejected(format!(
                "Manual takeover required: {}",
                message
            ))),
            Action::NoOp { .. } => Ok(ActionResult::done()),
            Action::Finish { message } => Ok(ActionResult {
                should_finish: true,
                message: message.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_absolute_scales_to_screen() {
        assert_eq!(to_absolute((500, 500), 1080, 2400).unwrap(), (540, 1200));
        assert_eq!(to_absolute((0, 0), 1080, 2400).unwrap(), (0, 0));
        assert_eq!(to_absolute((999, 999), 1000, 2000).unwrap(), (999, 1998));
    }

    #[test]
    fn test_to_absolute_rejects_out_of_range() {
        assert!(matches!(
            to_absolute((1000, 10), 1080, 2400),
            Err(HandlerError::Rejected(_))
        ));
        assert!(to_absolute((-1, 10), 1080, 2400).is_err());
    }

    #[tokio::test]
    async fn test_non_device_actions() {
        let handler = ActionHandler::new(AdbClient::new().with_path("/nonexistent/adb-binary"));

        let finish = Action::Finish {
            message: Some("done".to_string()),
        };
        let result = handler.execute("d1", &finish, 1080, 2400).await.unwrap();
        assert!(result.should_finish);

        let takeover = Action::TakeOver {
            message: "captcha".to_string(),
        };
        assert!(matches!(
            handler.execute("d1", &takeover, 1080, 2400).await,
            Err(HandlerError::Rejected(_))
        ));

        let unknown_app = Action::Launch {
            app: "NoSuchApp".to_string(),
        };
        assert!(matches!(
            handler.execute("d1", &unknown_app, 1080, 2400).await,
            Err(HandlerError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_adb_surfaces_adb_error() {
        let handler = ActionHandler::new(AdbClient::new().with_path("/nonexistent/adb-binary"));
        let result = handler.execute("d1", &Action::Back, 1080, 2400).await;
        assert!(matches!(result, Err(HandlerError::Adb(AdbError::Spawn(_)))));
    }
}
