pub mod context;
pub mod screenshot;
pub mod traits;
pub mod types;

pub use context::{capture, capture_or_empty, ScreenContext, ScreenDigest, ScreenSummary};
pub use traits::{ScreenAnalyzer, ScreenCapturer, NullAnalyzer};
