use async_trait::async_trait;

use crate::errors::DeskPilotResult;
use crate::perception::types::{RawCapture, ScreenshotResult};

/// Element detection over the live screen. The detection model itself lives
/// outside this crate; implementations only have to report boxes, text and type.
#[async_trait]
pub trait ScreenAnalyzer: Send + Sync {
    async fn capture(&self) -> DeskPilotResult<RawCapture>;
}

/// Pixel capture of the screen for realtime media frames.
#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    async fn screenshot(&self) -> DeskPilotResult<ScreenshotResult>;
}

/// Analyzer used when no detection backend is wired in. Reports an empty
/// screen, so element-targeted actions fail with `ElementNotFound`.
pub struct NullAnalyzer;

#[async_trait]
impl ScreenAnalyzer for NullAnalyzer {
    async fn capture(&self) -> DeskPilotResult<RawCapture> {
        Ok(RawCapture::default())
    }
}
