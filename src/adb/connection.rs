//! ADB command runner shared by the device, input and screenshot helpers.

use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// ADB errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdbError {
    #[error("Failed to spawn adb: {0}")]
    Spawn(String),
    #[error("adb timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device not available: {0}")]
    DeviceNotFound(String),
    #[error("Command execution failed: {0}")]
    CommandFailed(String),
}

/// Runs `adb` commands against a device.
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), phone_orchestrator::adb::AdbError> {
/// use phone_orchestrator::adb::AdbClient;
///
/// let adb = AdbClient::new();
/// adb.shell("emulator-5554", &["input", "keyevent", "4"]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AdbClient {
    adb_path: String,
    command_timeout: Duration,
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbClient {
    /// Create a runner using `adb` from `PATH`.
    pub fn new() -> Self {
        Self {
            adb_path: "adb".to_string(),
            command_timeout: Duration::from_secs(15),
        }
    }

    /// Use a custom adb binary.
    pub fn with_path(mut self, adb_path: impl Into<String>) -> Self {
        self.adb_path = adb_path.into();
        self
    }

    /// Bound every adb invocation by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run `adb -s <device> <args...>` and collect its output.
    pub async fn run(&self, device_id: &str, args: &[&str]) -> Result<Output, AdbError> {
        let prefix = get_adb_prefix(&self.adb_path, Some(device_id));
        let child = Command::new(&prefix[0])
            .args(&prefix[1..])
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| AdbError::Timeout(self.command_timeout))?
            .map_err(|e| AdbError::Spawn(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_device_missing(&stderr) {
            return Err(AdbError::DeviceNotFound(format!(
                "{}: {}",
                device_id,
                stderr.trim()
            )));
        }

        Ok(output)
    }

    /// Run `adb -s <device> shell <args...>`, failing on a non-zero exit.
    pub async fn shell(&self, device_id: &str, args: &[&str]) -> Result<String, AdbError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);

        let output = self.run(device_id, &full).await?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed(format!(
                "adb shell {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Serials of devices in the `device` state (`adb devices`).
    pub async fn list_devices(&self) -> Result<Vec<String>, AdbError> {
        let child = Command::new(&self.adb_path)
            .arg("devices")
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| AdbError::Timeout(self.command_timeout))?
            .map_err(|e| AdbError::Spawn(e.to_string()))?;

        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

fn is_device_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("not found")
        || stderr.contains("no devices")
        || stderr.contains("device offline")
        || stderr.contains("unauthorized")
}

/// Get ADB command prefix with optional device specifier.
pub(crate) fn get_adb_prefix(adb_path: &str, device_id: Option<&str>) -> Vec<String> {
    match device_id {
        Some(id) => vec![adb_path.to_string(), "-s".to_string(), id.to_string()],
        None => vec![adb_path.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_adb_prefix() {
        let prefix = get_adb_prefix("adb", None);
        assert_eq!(prefix, vec!["adb"]);

        let prefix_with_device = get_adb_prefix("adb", Some("device123"));
        assert_eq!(prefix_with_device, vec!["adb", "-s", "device123"]);
    }

    #[test]
    fn test_device_missing_detection() {
        assert!(is_device_missing("error: device 'abc' not found"));
        assert!(is_device_missing("error: no devices/emulators found"));
        assert!(!is_device_missing(""));
    }

    #[test]
    fn test_parse_devices_skips_offline() {
        let stdout = "List of devices attached\nemulator-5554\tdevice\n192.168.1.5:5555\toffline\nR58M\tunauthorized\n\n";
        assert_eq!(parse_devices(stdout), vec!["emulator-5554"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let adb = AdbClient::new().with_path("/nonexistent/adb-binary");
        let err = adb.run("emulator-5554", &["devices"]).await.unwrap_err();
        assert!(matches!(err, AdbError::Spawn(_)));
    }
}
