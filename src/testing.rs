// In-memory stand-ins for the network, the screen and the input devices.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::action::ScrollDirection;
use crate::agent_engine::engine::{EngineParts, ProtocolEngine, SessionHandle};
use crate::agent_engine::state::ConnectionState;
use crate::config::{AppConfig, ExecutorConfig};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::executor::input::Actuator;
use crate::perception::types::{BoundingBox, DetectedElement, RawCapture, ScreenshotResult};
use crate::perception::{ScreenAnalyzer, ScreenCapturer};
use crate::protocol::transport::{Connector, FrameSink, FrameSource};

pub fn el(ty: &str, text: &str, (x1, y1, x2, y2): (i32, i32, i32, i32), clickable: bool) -> DetectedElement {
    DetectedElement {
        element_type: ty.to_string(),
        text: text.to_string(),
        bbox: BoundingBox::new(x1, y1, x2, y2),
        confidence: 0.9,
        clickable,
    }
}

pub fn capture_of(elements: Vec<DetectedElement>) -> RawCapture {
    RawCapture {
        elements,
        regions: vec![],
    }
}

pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        run_dialog_delay_ms: 0,
        launch_settle_ms: 0,
        ..ExecutorConfig::default()
    }
}

// ── Screen ──────────────────────────────────────────────────────────────────

/// Returns the same capture every time, or fails every time.
pub struct ScriptedAnalyzer {
    capture: Option<RawCapture>,
}

impl ScriptedAnalyzer {
    pub fn always(capture: RawCapture) -> Self {
        Self { capture: Some(capture) }
    }

    pub fn failing() -> Self {
        Self { capture: None }
    }
}

#[async_trait]
impl ScreenAnalyzer for ScriptedAnalyzer {
    async fn capture(&self) -> DeskPilotResult<RawCapture> {
        self.capture
            .clone()
            .ok_or_else(|| DeskPilotError::Capture("scripted failure".into()))
    }
}

pub struct StaticCapturer;

#[async_trait]
impl ScreenCapturer for StaticCapturer {
    async fn screenshot(&self) -> DeskPilotResult<ScreenshotResult> {
        Ok(ScreenshotResult {
            mime_type: "image/jpeg".into(),
            image_base64: "/9j/AA==".into(),
            width: 2,
            height: 2,
        })
    }
}

// ── Input ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Click(i32, i32),
    Move(i32, i32),
    Type(String),
    Press(String),
    Scroll(ScrollDirection, i32),
}

#[derive(Default)]
pub struct RecordingActuator {
    inputs: Mutex<Vec<Input>>,
    fail: bool,
}

impl RecordingActuator {
    /// Every primitive reports an OS-level failure.
    pub fn failing() -> Self {
        Self { inputs: Mutex::new(Vec::new()), fail: true }
    }

    pub fn inputs(&self) -> Vec<Input> {
        self.inputs.lock().unwrap().clone()
    }

    fn record(&self, input: Input) -> DeskPilotResult<()> {
        if self.fail {
            return Err(DeskPilotError::Actuator("device unavailable".into()));
        }
        self.inputs.lock().unwrap().push(input);
        Ok(())
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn click(&self, x: i32, y: i32) -> DeskPilotResult<()> {
        self.record(Input::Click(x, y))
    }

    async fn move_to(&self, x: i32, y: i32) -> DeskPilotResult<()> {
        self.record(Input::Move(x, y))
    }

    async fn type_text(&self, text: &str) -> DeskPilotResult<()> {
        self.record(Input::Type(text.to_string()))
    }

    async fn press_key(&self, combo: &str) -> DeskPilotResult<()> {
        self.record(Input::Press(combo.to_string()))
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> DeskPilotResult<()> {
        self.record(Input::Scroll(direction, amount))
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

pub type Written = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
pub struct RecordingSink {
    written: Written,
    broken: bool,
}

impl RecordingSink {
    pub fn broken() -> Self {
        Self { written: Written::default(), broken: true }
    }

    pub fn written(&self) -> Written {
        self.written.clone()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: String) -> DeskPilotResult<()> {
        if self.broken {
            return Err(DeskPilotError::Transport("broken pipe".into()));
        }
        self.written.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> DeskPilotResult<()> {
        Ok(())
    }
}

/// Plays back a fixed list of server frames, then closes or goes quiet.
struct ScriptedSource {
    frames: VecDeque<String>,
    close_when_done: bool,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Option<DeskPilotResult<String>> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(Ok(frame));
        }
        if self.close_when_done {
            return None;
        }
        std::future::pending().await
    }
}

/// What one `connect()` call yields.
pub enum ScriptedConnection {
    Refused,
    Open { frames: Vec<String>, close_when_done: bool },
}

impl ScriptedConnection {
    pub fn open(frames: Vec<&str>, close_when_done: bool) -> Self {
        ScriptedConnection::Open {
            frames: frames.into_iter().map(str::to_string).collect(),
            close_when_done,
        }
    }

    pub fn refused() -> Self {
        ScriptedConnection::Refused
    }
}

/// Hands out scripted connections in order; refuses once the script runs
/// out. Frames written on any connection land in one shared log.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ScriptedConnection>>,
    connects: AtomicUsize,
    written: Written,
}

impl ScriptedConnector {
    pub fn new(script: Vec<ScriptedConnection>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            connects: AtomicUsize::new(0),
            written: Written::default(),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> DeskPilotResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedConnection::Open { frames, close_when_done }) => {
                let sink = RecordingSink { written: self.written.clone(), broken: false };
                let source = ScriptedSource { frames: frames.into(), close_when_done };
                Ok((Box::new(sink), Box::new(source)))
            }
            Some(ScriptedConnection::Refused) | None => {
                Err(DeskPilotError::Transport("connection refused".into()))
            }
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

/// Defaults with every delay zeroed and no journal on disk.
pub fn quiet_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.session.step_delay_ms = 0;
    config.session.reconnect_backoff_ms = 0;
    config.session.max_reconnect_attempts = 0;
    config.session.journal = false;
    config.executor = fast_executor_config();
    config
}

/// Starts an engine on a connection that acks setup and then stays quiet,
/// and waits until it is `Active`.
pub async fn active_session() -> (
    SessionHandle,
    JoinHandle<DeskPilotResult<()>>,
    Arc<ScriptedConnector>,
) {
    let connector = Arc::new(ScriptedConnector::new(vec![ScriptedConnection::open(
        vec![r#"{"setupComplete":{}}"#],
        false,
    )]));
    let (engine, _events) = ProtocolEngine::new(
        &quiet_config(),
        EngineParts {
            connector: connector.clone(),
            analyzer: Arc::new(ScriptedAnalyzer::failing()),
            actuator: Arc::new(RecordingActuator::default()),
            capturer: None,
        },
    )
    .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());
    assert_eq!(handle.wait_ready().await, ConnectionState::Active);
    (handle, run, connector)
}

/// Text of every `client_content` frame written so far.
pub fn sent_texts(connector: &ScriptedConnector) -> Vec<String> {
    connector
        .written()
        .iter()
        .filter_map(|f| serde_json::from_str::<serde_json::Value>(f).ok())
        .filter_map(|v| {
            v["client_content"]["turns"][0]["parts"][0]["text"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}
