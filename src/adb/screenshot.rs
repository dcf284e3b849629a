//! Screen capture via `adb exec-out screencap -p`.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;

use crate::transport::Screenshot;

use super::connection::{AdbClient, AdbError};

const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;
const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Capture the screen of `device_id`.
///
/// Screens that refuse capture (payment pages and similar) yield a black
/// fallback image with `is_sensitive = true`. Unparseable output yields the
/// same fallback without the flag. Only a missing device or a failed adb
/// invocation is an error.
pub async fn get_screenshot(adb: &AdbClient, device_id: &str) -> Result<Screenshot, AdbError> {
    let output = adb.run(device_id, &["exec-out", "screencap", "-p"]).await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Status: -1") || stderr.contains("Failed") || stderr.contains("error") {
        tracing::warn!(device = device_id, "Screenshot refused (sensitive screen): {}", stderr.trim());
        return Ok(fallback_screenshot(true));
    }

    Ok(decode_png(&output.stdout).unwrap_or_else(|reason| {
        tracing::error!(device = device_id, "Invalid screenshot data: {}", reason);
        fallback_screenshot(false)
    }))
}

/// Validate PNG bytes and wrap them as a [`Screenshot`].
pub(crate) fn decode_png(png_data: &[u8]) -> Result<Screenshot, String> {
    if png_data.len() < PNG_MAGIC.len() {
        return Err(format!("data too small: {} bytes", png_data.len()));
    }
    if &png_data[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(format!("bad PNG header {:?}", &png_data[..PNG_MAGIC.len()]));
    }

    let img = image::load_from_memory(png_data).map_err(|e| e.to_string())?;
    Ok(Screenshot::new(
        STANDARD.encode(png_data),
        img.width(),
        img.height(),
        false,
    ))
}

/// Black full-size placeholder image.
pub fn fallback_screenshot(is_sensitive: bool) -> Screenshot {
    let black = RgbImage::from_pixel(FALLBACK_WIDTH, FALLBACK_HEIGHT, image::Rgb([0, 0, 0]));

    let mut buffer = Cursor::new(Vec::new());
    let base64_data = match DynamicImage::ImageRgb8(black).write_to(&mut buffer, image::ImageFormat::Png) {
        Ok(()) => STANDARD.encode(buffer.into_inner()),
        Err(e) => {
            tracing::error!("Failed to encode fallback screenshot: {}", e);
            String::new()
        }
    };

    Screenshot::new(base64_data, FALLBACK_WIDTH, FALLBACK_HEIGHT, is_sensitive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([255, 0, 0]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_fallback_screenshot() {
        let screenshot = fallback_screenshot(true);
        assert_eq!(screenshot.width, 1080);
        assert_eq!(screenshot.height, 2400);
        assert!(screenshot.is_sensitive);
        assert!(!screenshot.base64_data.is_empty());
    }

    #[test]
    fn test_decode_png_reads_dimensions() {
        let shot = decode_png(&tiny_png(4, 7)).unwrap();
        assert_eq!((shot.width, shot.height), (4, 7));
        assert!(!shot.is_sensitive);
    }

    #[test]
    fn test_decode_png_rejects_garbage() {
        assert!(decode_png(b"abc").is_err());
        assert!(decode_png(b"not a png at all").is_err());
    }
}
