//! Text input through the ADB Keyboard IME.
//!
//! Requires ADB Keyboard on the device: <https://github.com/senzhk/ADBKeyBoard>

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};

use super::connection::{AdbClient, AdbError};

const ADB_IME: &str = "com.android.adbkeyboard/.AdbIME";
const KEYBOARD_SETTLE: Duration = Duration::from_millis(500);

/// Type text into the focused field.
pub async fn type_text(adb: &AdbClient, device_id: &str, text: &str) -> Result<(), AdbError> {
    let encoded_text = STANDARD.encode(text.as_bytes());
    adb.shell(
        device_id,
        &["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded_text],
    )
    .await
    .map(|_| ())
}

/// Clear the focused field.
pub async fn clear_text(adb: &AdbClient, device_id: &str) -> Result<(), AdbError> {
    adb.shell(device_id, &["am", "broadcast", "-a", "ADB_CLEAR_TEXT"])
        .await
        .map(|_| ())
}

/// Switch to ADB Keyboard, returning the previous IME for restoration.
pub async fn detect_and_set_adb_keyboard(
    adb: &AdbClient,
    device_id: &str,
) -> Result<String, AdbError> {
    let current_ime = adb
        .shell(device_id, &["settings", "get", "secure", "default_input_method"])
        .await?
        .trim()
        .to_string();

    if !current_ime.contains(ADB_IME) {
        adb.shell(device_id, &["ime", "set", ADB_IME]).await?;
    }

    // Warm up the keyboard
    type_text(adb, device_id, "").await?;

    Ok(current_ime)
}

/// Restore a previously active IME.
pub async fn restore_keyboard(adb: &AdbClient, device_id: &str, ime: &str) -> Result<(), AdbError> {
    if ime.is_empty() || ime.contains(ADB_IME) {
        return Ok(());
    }
    adb.shell(device_id, &["ime", "set", ime]).await.map(|_| ())
}

/// Switch keyboard, clear, type, then restore the original keyboard.
pub async fn type_text_with_keyboard_handling(
    adb: &AdbClient,
    device_id: &str,
    text: &str,
) -> Result<(), AdbError> {
    let original_ime = detect_and_set_adb_keyboard(adb, device_id).await?;
    tokio::time::sleep(KEYBOARD_SETTLE).await;

    clear_text(adb, device_id).await?;
    tokio::time::sleep(KEYBOARD_SETTLE).await;

    type_text(adb, device_id, text).await?;
    tokio::time::sleep(KEYBOARD_SETTLE).await;

    restore_keyboard(adb, device_id, &original_ime).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_skips_adb_ime() {
        let adb = AdbClient::new().with_path("/nonexistent/adb-binary");
        assert!(restore_keyboard(&adb, "d1", ADB_IME).await.is_ok());
        assert!(restore_keyboard(&adb, "d1", "").await.is_ok());
        assert!(restore_keyboard(&adb, "d1", "com.other/.Ime").await.is_err());
    }
}
