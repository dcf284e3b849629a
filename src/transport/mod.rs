//! Device-control transport boundary.
//!
//! The orchestration core only ever talks to a device through
//! [`DeviceTransport`]. [`AdbTransport`] drives real devices; tests plug in
//! scripted fakes.

mod adb;

pub use adb::AdbTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device (or the transport in front of it) could not be reached.
    #[error("DeviceUnreachable: {0}")]
    DeviceUnreachable(String),
    /// The transport answered but refused to apply the instruction.
    #[error("ActionRejected: {0}")]
    ActionRejected(String),
}

impl TransportError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceUnreachable(_) => "DeviceUnreachable",
            Self::ActionRejected(_) => "ActionRejected",
        }
    }
}

/// A captured device screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    /// PNG bytes, base64 encoded.
    pub base64_data: String,
    pub width: u32,
    pub height: u32,
    /// Set when the device refused the capture (payment pages and similar).
    pub is_sensitive: bool,
}

impl Screenshot {
    /// Create a new screenshot.
    pub fn new(base64_data: String, width: u32, height: u32, is_sensitive: bool) -> Self {
        Self {
            base64_data,
            width,
            height,
            is_sensitive,
        }
    }
}

/// Acknowledgement returned by a successfully applied instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionAck {
    /// Optional transport message (e.g. "Launched 微信").
    pub message: Option<String>,
}

impl ActionAck {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Device-control transport consumed by the step executor.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Capture the current screen of `device_id`.
    async fn capture_screenshot(&self, device_id: &str) -> Result<Screenshot, TransportError>;

    /// Apply one instruction on `device_id`.
    async fn apply_instruction(
        &self,
        device_id: &str,
        instruction: &str,
    ) -> Result<ActionAck, TransportError>;
}
