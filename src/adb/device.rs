//! Device control commands (tap, swipe, keys, app launch).

use std::time::Duration;

use crate::config::{find_app_in, get_package};

use super::connection::{AdbClient, AdbError};

/// Get the currently focused app name, or "System Home" when unrecognized.
pub async fn get_current_app(adb: &AdbClient, device_id: &str) -> Result<String, AdbError> {
    let stdout = adb.shell(device_id, &["dumpsys", "window"]).await?;

    for line in stdout.lines() {
        if line.contains("mCurrentFocus") || line.contains("mFocusedApp") {
            if let Some(app_name) = find_app_in(line) {
                return Ok(app_name.to_string());
            }
        }
    }

    Ok("System Home".to_string())
}

/// Tap at absolute pixel coordinates.
pub async fn tap(adb: &AdbClient, device_id: &str, x: i32, y: i32) -> Result<(), AdbError> {
    adb.shell(device_id, &["input", "tap", &x.to_string(), &y.to_string()])
        .await
        .map(|_| ())
}

/// Double tap at absolute pixel coordinates.
pub async fn double_tap(adb: &AdbClient, device_id: &str, x: i32, y: i32) -> Result<(), AdbError> {
    tap(adb, device_id, x, y).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tap(adb, device_id, x, y).await
}

/// Long press, implemented as a zero-distance swipe.
pub async fn long_press(
    adb: &AdbClient,
    device_id: &str,
    x: i32,
    y: i32,
    duration_ms: Option<u64>,
) -> Result<(), AdbError> {
    let duration = duration_ms.unwrap_or(3000);
    let (x, y) = (x.to_string(), y.to_string());
    adb.shell(
        device_id,
        &["input", "swipe", &x, &y, &x, &y, &duration.to_string()],
    )
    .await
    .map(|_| ())
}

/// Swipe duration derived from distance when not given explicitly.
pub(crate) fn swipe_duration(start: (i32, i32), end: (i32, i32)) -> u64 {
    let dx = (start.0 - end.0) as i64;
    let dy = (start.1 - end.1) as i64;
    ((dx * dx + dy * dy) as u64 / 1000).clamp(1000, 2000)
}

/// Swipe between two absolute pixel coordinates.
pub async fn swipe(
    adb: &AdbClient,
    device_id: &str,
    start: (i32, i32),
    end: (i32, i32),
    duration_ms: Option<u64>,
) -> Result<(), AdbError> {
    let duration = duration_ms.unwrap_or_else(|| swipe_duration(start, end));
    adb.shell(
        device_id,
        &[
            "input",
            "swipe",
            &start.0.to_string(),
            &start.1.to_string(),
            &end.0.to_string(),
            &end.1.to_string(),
            &duration.to_string(),
        ],
    )
    .await
    .map(|_| ())
}

/// Press the back button.
pub async fn back(adb: &AdbClient, device_id: &str) -> Result<(), AdbError> {
    adb.shell(device_id, &["input", "keyevent", "4"])
        .await
        .map(|_| ())
}

/// Press the home button.
pub async fn home(adb: &AdbClient, device_id: &str) -> Result<(), AdbError> {
    adb.shell(device_id, &["input", "keyevent", "KEYCODE_HOME"])
        .await
        .map(|_| ())
}

/// Launch an app by display name.
///
/// Returns `Ok(false)` when the name has no known package.
pub async fn launch_app(adb: &AdbClient, device_id: &str, app_name: &str) -> Result<bool, AdbError> {
    let Some(package) = get_package(app_name) else {
        return Ok(false);
    };

    adb.shell(
        device_id,
        &[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ],
    )
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_app_unknown() {
        let adb = AdbClient::new().with_path("/nonexistent/adb-binary");
        assert!(!launch_app(&adb, "emulator-5554", "UnknownApp123").await.unwrap());
    }

    #[test]
    fn test_swipe_duration_is_clamped() {
        assert_eq!(swipe_duration((0, 0), (10, 10)), 1000);
        assert_eq!(swipe_duration((0, 0), (0, 5000)), 2000);
        assert_eq!(swipe_duration((0, 0), (0, 1200)), 1440);
    }
}
