use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::perception::traits::ScreenCapturer;
use crate::perception::types::ScreenshotResult;

/// Longest edge of a screenshot sent upstream.
pub const MAX_EDGE: u32 = 1024;

/// Captures the primary monitor via xcap.
pub struct PrimaryMonitorCapturer;

#[async_trait]
impl ScreenCapturer for PrimaryMonitorCapturer {
    async fn screenshot(&self) -> DeskPilotResult<ScreenshotResult> {
        capture_primary().await
    }
}

/// Captures the primary monitor, fits it into `MAX_EDGE`×`MAX_EDGE` and
/// encodes it as base64 JPEG.
pub async fn capture_primary() -> DeskPilotResult<ScreenshotResult> {
    tokio::task::spawn_blocking(capture_primary_blocking)
        .await
        .map_err(|e| DeskPilotError::Capture(format!("join: {e}")))?
}

fn capture_primary_blocking() -> DeskPilotResult<ScreenshotResult> {
    let monitors =
        xcap::Monitor::all().map_err(|e| DeskPilotError::Capture(format!("monitors: {e}")))?;
    let monitor = monitors
        .iter()
        .find(|m| m.is_primary())
        .or_else(|| monitors.first())
        .ok_or_else(|| DeskPilotError::Capture("no monitor found".into()))?;

    let rgba = monitor
        .capture_image()
        .map_err(|e| DeskPilotError::Capture(format!("capture: {e}")))?;
    encode_jpeg(DynamicImage::ImageRgba8(rgba))
}

/// Downscales (never upscales) and encodes as JPEG. JPEG has no alpha
/// channel, so the image is flattened to RGB first.
pub fn encode_jpeg(img: DynamicImage) -> DeskPilotResult<ScreenshotResult> {
    let img = if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img.thumbnail(MAX_EDGE, MAX_EDGE)
    } else {
        img
    };
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .map_err(|e| DeskPilotError::Capture(format!("jpeg encode: {e}")))?;

    tracing::debug!(
        width = rgb.width(),
        height = rgb.height(),
        bytes = bytes.len(),
        "screenshot encoded"
    );

    Ok(ScreenshotResult {
        mime_type: "image/jpeg".into(),
        image_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        width: rgb.width(),
        height: rgb.height(),
    })
}
