use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionKind};
use crate::agent_engine::context::{ContextSnapshot, SessionContext};
use crate::agent_engine::history::{ActionHistory, HistoryEntry};
use crate::agent_engine::state::{ConnectionState, ReconnectOutcome, SessionEvent};
use crate::config::{ApiConfig, AppConfig, SessionConfig};
use crate::errors::{ActionError, DeskPilotError, DeskPilotResult};
use crate::executor::coordinator::StepRunner;
use crate::executor::dispatcher::ActionDispatcher;
use crate::executor::input::Actuator;
use crate::perception::{capture_or_empty, ScreenAnalyzer, ScreenCapturer};
use crate::planner::ActionPlanner;
use crate::protocol::tools::{function_declarations, COMPUTER_ACTION};
use crate::protocol::transport::{Connector, FrameSource};
use crate::protocol::types::{
    parse_inbound, BrokenCall, FunctionCall, GenerationConfig, InboundFrame, ModelPart, OutboundFrame, Part,
    SetupPayload, SystemInstruction, ToolResult, ToolSet,
};
use crate::protocol::writer::{self, Outbound, OutboundQueue};

/// How long teardown waits for the writer to flush before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub type ReconnectCallback = Arc<dyn Fn(&ReconnectOutcome) + Send + Sync>;

/// External collaborators the engine drives.
pub struct EngineParts {
    pub connector: Arc<dyn Connector>,
    pub analyzer: Arc<dyn ScreenAnalyzer>,
    pub actuator: Arc<dyn Actuator>,
    /// Screenshots for `realtime_input`; `None` disables them.
    pub capturer: Option<Arc<dyn ScreenCapturer>>,
}

struct Connection {
    source: Box<dyn FrameSource>,
    writer: JoinHandle<DeskPilotResult<()>>,
    write_failed: oneshot::Receiver<DeskPilotError>,
}

/// Why the serve loop returned.
enum ServeExit {
    Stopped,
    RemoteError(String),
    Lost(DeskPilotError),
}

/// Owns the streaming connection and the session. Inbound frames are handled
/// one at a time on this task; producers only reach it through a
/// [`SessionHandle`].
pub struct ProtocolEngine {
    api: ApiConfig,
    config: SessionConfig,
    declarations: Vec<serde_json::Value>,

    connector: Arc<dyn Connector>,
    capturer: Option<Arc<dyn ScreenCapturer>>,
    analyzer: Arc<dyn ScreenAnalyzer>,
    dispatcher: ActionDispatcher,
    planner: ActionPlanner,
    session: SessionContext,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    context_tx: watch::Sender<ContextSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,

    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: OutboundQueue,
    /// Tool calls received but not yet answered, id -> function name.
    pending: HashMap<String, String>,

    stop: CancellationToken,
    on_reconnect: Option<ReconnectCallback>,
}

impl ProtocolEngine {
    pub fn new(
        config: &AppConfig,
        parts: EngineParts,
    ) -> DeskPilotResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let declarations = function_declarations()?;
        let history = if config.session.journal {
            ActionHistory::with_default_journal(config.session.history_capacity)
        } else {
            ActionHistory::new(config.session.history_capacity)
        };
        tracing::info!(
            session_id = %history.session_id,
            journal = ?history.journal_path(),
            "session created"
        );

        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = writer::outbound_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (context_tx, _) = watch::channel(ContextSnapshot::default());
        let stop = CancellationToken::new();

        let engine = Self {
            api: config.api.clone(),
            config: config.session.clone(),
            declarations,
            connector: parts.connector,
            capturer: parts.capturer,
            analyzer: parts.analyzer.clone(),
            dispatcher: ActionDispatcher::new(
                parts.analyzer,
                parts.actuator,
                config.executor.clone(),
            )
            .with_stop(stop.clone()),
            planner: ActionPlanner::new(),
            session: SessionContext::new(history),
            state: ConnectionState::Disconnected,
            state_tx,
            context_tx,
            events,
            outbound_tx,
            outbound_rx,
            pending: HashMap::new(),
            stop,
            on_reconnect: None,
        };
        Ok((engine, events_rx))
    }

    /// Invoked after every reconnect sequence, successful or not.
    pub fn on_reconnect(mut self, callback: ReconnectCallback) -> Self {
        self.on_reconnect = Some(callback);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            outbound: self.outbound_tx.clone(),
            context: self.context_tx.subscribe(),
            state: self.state_tx.subscribe(),
            analyzer: self.analyzer.clone(),
            stop: self.stop.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connects, serves until stopped, and reconnects on transport loss.
    /// Returns `Err` when the session ends in `Failed`.
    pub async fn run(mut self) -> DeskPilotResult<()> {
        let result = self.run_inner().await;
        match &result {
            Ok(()) => tracing::info!("session ended"),
            Err(DeskPilotError::Cancelled) => {
                tracing::info!("session stopped while reconnecting");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(error = %e, "session failed");
                self.transition(ConnectionState::Failed);
            }
        }
        self.stop.cancel();
        result
    }

    async fn run_inner(&mut self) -> DeskPilotResult<()> {
        let mut conn = self.connect_once().await?;
        loop {
            match self.serve(&mut conn).await {
                ServeExit::Stopped => {
                    self.close_connection(conn).await;
                    return Ok(());
                }
                ServeExit::RemoteError(msg) => {
                    tracing::warn!(error = %msg, "server sent an error frame, closing");
                    self.close_connection(conn).await;
                    return Ok(());
                }
                ServeExit::Lost(cause) => {
                    tracing::warn!(error = %cause, "connection lost");
                    self.close_connection(conn).await;
                    conn = self.reconnect(cause).await?;
                }
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────────────

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition(next) {
            tracing::error!(from = ?self.state, to = ?next, "illegal state transition ignored");
            return;
        }
        tracing::info!(from = ?self.state, to = ?next, "connection state");
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    fn setup_frame(&self) -> OutboundFrame {
        OutboundFrame::Setup(SetupPayload {
            model: self.api.model.clone(),
            tools: vec![ToolSet {
                function_declarations: self.declarations.clone(),
            }],
            system_instruction: self.api.system_instruction.as_ref().map(|text| SystemInstruction {
                parts: vec![Part::Text { text: text.clone() }],
            }),
            generation_config: GenerationConfig {
                temperature: self.api.temperature,
                response_modalities: self.api.response_modalities.clone(),
            },
        })
    }

    /// One connect + setup handshake. Leaves the state at `Active` on success
    /// and wherever the attempt stopped on failure.
    async fn connect_once(&mut self) -> DeskPilotResult<Connection> {
        self.transition(ConnectionState::Connecting);
        let (mut sink, mut source) = self.connector.connect().await?;

        let dropped = writer::drain_stale(&self.outbound_rx).await;
        if dropped > 0 {
            tracing::info!(dropped, "discarded frames from previous connection");
        }

        sink.send(self.setup_frame().to_json()?).await?;
        self.transition(ConnectionState::AwaitingSetupAck);

        let timeout_ms = self.config.setup_timeout_ms;
        let reply = tokio::time::timeout(Duration::from_millis(timeout_ms), source.next_frame())
            .await
            .map_err(|_| DeskPilotError::SetupTimeout(timeout_ms))?;
        let text = match reply {
            None => return Err(DeskPilotError::Transport("connection closed during setup".into())),
            Some(reply) => reply?,
        };
        match parse_inbound(&text) {
            Ok(InboundFrame::SetupAck) => {}
            Ok(InboundFrame::Error(msg)) => return Err(DeskPilotError::SetupRejected(msg)),
            Ok(other) => {
                return Err(DeskPilotError::SetupRejected(format!(
                    "unexpected setup reply: {}",
                    other.kind()
                )))
            }
            Err(e) => return Err(DeskPilotError::SetupRejected(e.to_string())),
        }

        let writer = writer::spawn_writer(sink, self.outbound_rx.clone());
        self.transition(ConnectionState::Active);
        self.publish_context();
        Ok(Connection {
            source,
            writer: writer.handle,
            write_failed: writer.failed,
        })
    }

    /// `Active -> Closing -> Disconnected`. Everything already enqueued is
    /// flushed before the sink closes; unanswered calls are dropped.
    async fn close_connection(&mut self, conn: Connection) {
        self.transition(ConnectionState::Closing);
        let _ = self.outbound_tx.send(Outbound::Close);

        let mut writer = conn.writer;
        match tokio::time::timeout(CLOSE_GRACE, &mut writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "writer ended with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "writer task panicked"),
            Err(_) => {
                tracing::warn!("writer did not flush in time, aborting");
                writer.abort();
            }
        }

        for (call_id, name) in self.pending.drain() {
            tracing::warn!(call_id = %call_id, name = %name, "dropping unanswered tool call");
        }
        self.transition(ConnectionState::Disconnected);
    }

    async fn reconnect(&mut self, cause: DeskPilotError) -> DeskPilotResult<Connection> {
        let max = self.config.max_reconnect_attempts;
        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);
        let mut last_error = cause.to_string();

        for attempt in 1..=max {
            tokio::select! {
                _ = self.stop.cancelled() => return Err(DeskPilotError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            tracing::info!(attempt, max, "reconnecting");
            match self.connect_once().await {
                Ok(conn) => {
                    self.notify_reconnect(ReconnectOutcome::Restored { attempts: attempt });
                    return Ok(conn);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e.to_string();
                    self.transition(ConnectionState::Disconnected);
                }
            }
        }

        self.notify_reconnect(ReconnectOutcome::Exhausted {
            attempts: max,
            last_error: last_error.clone(),
        });
        Err(DeskPilotError::Transport(format!(
            "reconnect failed after {max} attempts: {last_error}"
        )))
    }

    fn notify_reconnect(&self, outcome: ReconnectOutcome) {
        tracing::info!(?outcome, "reconnect outcome");
        if let Some(cb) = &self.on_reconnect {
            cb(&outcome);
        }
        let _ = self.events.send(SessionEvent::Reconnect(outcome));
    }

    // ── Active ──────────────────────────────────────────────────────────────

    async fn serve(&mut self, conn: &mut Connection) -> ServeExit {
        let stop = self.stop.clone();
        let mut ticker = (self.config.snapshot_interval_secs > 0 && self.capturer.is_some())
            .then(|| {
                let period = Duration::from_secs(self.config.snapshot_interval_secs);
                interval_at(Instant::now() + period, period)
            });

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return ServeExit::Stopped,
                failed = &mut conn.write_failed => {
                    return ServeExit::Lost(failed.unwrap_or_else(|_| {
                        DeskPilotError::Transport("writer stopped".into())
                    }));
                }
                frame = conn.source.next_frame() => {
                    let text = match frame {
                        None => {
                            return ServeExit::Lost(DeskPilotError::Transport(
                                "connection closed by peer".into(),
                            ))
                        }
                        Some(Err(DeskPilotError::MalformedFrame(e))) => {
                            tracing::warn!(error = %e, "dropping undecodable frame");
                            continue;
                        }
                        Some(Err(e)) => return ServeExit::Lost(e),
                        Some(Ok(text)) => text,
                    };
                    match parse_inbound(&text) {
                        Ok(frame) => {
                            if let Some(exit) = self.dispatch(frame).await {
                                return exit;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, bytes = text.len(), "dropping frame"),
                    }
                }
                _ = tick(&mut ticker) => self.send_screenshot().await,
            }
        }
    }

    async fn dispatch(&mut self, frame: InboundFrame) -> Option<ServeExit> {
        tracing::debug!(kind = frame.kind(), "inbound frame");
        match frame {
            InboundFrame::ToolCall(calls) => {
                for call in calls {
                    match call {
                        Ok(call) => self.handle_tool_call(call).await,
                        Err(broken) => self.reject_tool_call(broken),
                    }
                }
            }
            InboundFrame::ContentTurn {
                parts,
                turn_complete,
            } => {
                for part in parts {
                    self.surface_part(part);
                }
                if turn_complete {
                    self.on_turn_complete().await;
                }
            }
            InboundFrame::TurnComplete => self.on_turn_complete().await,
            InboundFrame::Error(msg) => return Some(ServeExit::RemoteError(msg)),
            InboundFrame::SetupAck => tracing::warn!("duplicate setupComplete ignored"),
            InboundFrame::Unrecognized(keys) => {
                tracing::warn!(?keys, "unrecognized frame ignored")
            }
        }
        None
    }

    fn surface_part(&self, part: ModelPart) {
        match part {
            ModelPart::Text(text) => {
                let _ = self.events.send(SessionEvent::ModelText(text));
            }
            ModelPart::Inline { mime_type, data } if mime_type.starts_with("audio/") => {
                match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                    Ok(bytes) => {
                        tracing::debug!(mime_type = %mime_type, bytes = bytes.len(), "model audio");
                        let _ = self.events.send(SessionEvent::ModelAudio {
                            mime_type,
                            data: bytes,
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "undecodable audio part"),
                }
            }
            ModelPart::Inline { mime_type, .. } => {
                tracing::debug!(mime_type = %mime_type, "inline part ignored")
            }
        }
    }

    async fn on_turn_complete(&mut self) {
        let _ = self.events.send(SessionEvent::TurnComplete);
        self.send_screenshot().await;
    }

    async fn send_screenshot(&self) {
        let Some(capturer) = &self.capturer else {
            return;
        };
        match capturer.screenshot().await {
            Ok(shot) => {
                tracing::debug!(
                    width = shot.width,
                    height = shot.height,
                    bytes = shot.image_base64.len(),
                    "sending screenshot"
                );
                self.enqueue(OutboundFrame::media(shot.mime_type, shot.image_base64));
            }
            Err(e) => tracing::warn!(error = %e, "screenshot failed"),
        }
    }

    // ── Tool calls ──────────────────────────────────────────────────────────

    async fn handle_tool_call(&mut self, call: FunctionCall) {
        tracing::info!(call_id = %call.id, name = %call.name, "tool call");
        if self
            .pending
            .insert(call.id.clone(), call.name.clone())
            .is_some()
        {
            tracing::warn!(call_id = %call.id, "tool call id reused while pending");
        }

        let result = if call.name != COMPUTER_ACTION {
            ToolResult::failed(ActionError::UnknownFunction(call.name.clone()))
        } else {
            match Action::from_args(&call.args) {
                Err(e) => ToolResult::failed(e),
                Ok(action) => match &action.kind {
                    ActionKind::ComplexTask { description } => {
                        let description = description.clone();
                        self.run_complex(&action, description).await
                    }
                    _ => self.run_single(&action).await,
                },
            }
        };
        self.respond(&call, result);
    }

    fn reject_tool_call(&mut self, broken: BrokenCall) {
        tracing::warn!(call_id = %broken.id, reason = %broken.reason, "undecodable tool call");
        let call = FunctionCall {
            name: String::new(),
            id: broken.id,
            args: serde_json::Value::Null,
        };
        self.pending.insert(call.id.clone(), call.name.clone());
        self.respond(&call, ToolResult::failed(ActionError::InvalidArguments(broken.reason)));
    }

    async fn run_single(&mut self, action: &Action) -> ToolResult {
        let runner = StepRunner {
            dispatcher: &self.dispatcher,
            planner: &self.planner,
            step_delay: Duration::from_millis(self.config.step_delay_ms),
            stop: &self.stop,
        };
        match runner.run_step(action, &mut self.session).await {
            Ok(()) => ToolResult::ok(),
            Err(e) => ToolResult::failed(e),
        }
    }

    /// Plans `description` against a fresh snapshot and runs the plan inside
    /// a task scope, so the stack is restored however the plan ends.
    async fn run_complex(&mut self, action: &Action, description: String) -> ToolResult {
        let runner = StepRunner {
            dispatcher: &self.dispatcher,
            planner: &self.planner,
            step_delay: Duration::from_millis(self.config.step_delay_ms),
            stop: &self.stop,
        };
        let (outcome, screen) = {
            let mut scope = self.session.enter_task(description.clone());
            let screen = capture_or_empty(runner.dispatcher.analyzer()).await;
            let plan = runner.planner.create_plan(&description, &screen);
            tracing::info!(task = %description, steps = plan.len(), "running plan");
            (runner.run_plan(plan, &mut scope).await, screen.summary())
        };

        let success = outcome.is_ok();
        self.session.set_state("last_task", description.clone());
        self.session
            .set_state("last_task_outcome", if success { "success" } else { "failed" });
        self.session.record(HistoryEntry {
            ts: chrono::Utc::now().timestamp_millis(),
            action: action.clone(),
            success,
            error: outcome.as_ref().err().map(ToString::to_string),
            reasoning: action.reasoning.clone(),
            screen,
        });

        match outcome {
            Ok(steps) => ToolResult::ok().with_steps(steps),
            Err(e) => ToolResult::failed(e),
        }
    }

    fn respond(&mut self, call: &FunctionCall, result: ToolResult) {
        if self.pending.remove(&call.id).is_none() {
            tracing::warn!(call_id = %call.id, "no pending call for response, not sent");
            return;
        }
        tracing::info!(call_id = %call.id, success = result.success, "tool response");
        let _ = self.events.send(SessionEvent::ActionReported {
            call_id: call.id.clone(),
            success: result.success,
            error: result.error.clone(),
        });
        let frame = OutboundFrame::tool_response(
            call.id.clone(),
            call.name.clone(),
            result,
            self.session.response_context(),
        );
        self.enqueue(frame);
        self.publish_context();
    }

    fn enqueue(&self, frame: OutboundFrame) {
        if self.outbound_tx.send(Outbound::Frame(frame)).is_err() {
            tracing::error!("outbound queue closed");
        }
    }

    fn publish_context(&self) {
        self.context_tx
            .send_replace(self.session.snapshot(self.config.context_history, None));
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable entry point for input producers. Sending only enqueues onto the
/// engine's writer; the session itself is read through published snapshots.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    context: watch::Receiver<ContextSnapshot>,
    state: watch::Receiver<ConnectionState>,
    analyzer: Arc<dyn ScreenAnalyzer>,
    stop: CancellationToken,
}

impl SessionHandle {
    /// Sends a user turn carrying the latest session snapshot and a fresh
    /// screen digest. Fails unless the connection is `Active`.
    pub async fn send_text(&self, text: &str) -> DeskPilotResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let state = self.state();
        if state != ConnectionState::Active {
            return Err(DeskPilotError::Transport(format!(
                "cannot send while {state:?}"
            )));
        }

        let screen = capture_or_empty(self.analyzer.as_ref()).await;
        let mut snapshot = self.context.borrow().clone();
        snapshot.screen = Some(screen.digest());
        let context = serde_json::to_value(&snapshot)?;

        tracing::info!(chars = text.chars().count(), "sending user text");
        self.outbound
            .send(Outbound::Frame(OutboundFrame::user_text(text, context)))
            .map_err(|_| DeskPilotError::Transport("session closed".into()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Resolves once the connection is `Active` (or has failed for good).
    pub async fn wait_ready(&self) -> ConnectionState {
        let mut rx = self.state.clone();
        let ready = rx
            .wait_for(|s| matches!(s, ConnectionState::Active | ConnectionState::Failed))
            .await
            .map(|s| *s);
        ready.unwrap_or(ConnectionState::Failed)
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::testing::{
        capture_of, el, fast_executor_config, Input, RecordingActuator, ScriptedAnalyzer,
        ScriptedConnection, ScriptedConnector, StaticCapturer,
    };

    const ACK: &str = r#"{"setupComplete":{}}"#;

    fn config(max_reconnect: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.api.system_instruction = Some("be brief".into());
        config.session.setup_timeout_ms = 200;
        config.session.max_reconnect_attempts = max_reconnect;
        config.session.reconnect_backoff_ms = 0;
        config.session.step_delay_ms = 0;
        config.session.journal = false;
        config.executor = fast_executor_config();
        config
    }

    struct Harness {
        engine: ProtocolEngine,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        connector: Arc<ScriptedConnector>,
        actuator: Arc<RecordingActuator>,
    }

    fn harness(
        config: &AppConfig,
        script: Vec<ScriptedConnection>,
        analyzer: ScriptedAnalyzer,
        capturer: Option<Arc<dyn ScreenCapturer>>,
    ) -> Harness {
        let connector = Arc::new(ScriptedConnector::new(script));
        let actuator = Arc::new(RecordingActuator::default());
        let (engine, events) = ProtocolEngine::new(
            config,
            EngineParts {
                connector: connector.clone(),
                analyzer: Arc::new(analyzer),
                actuator: actuator.clone(),
                capturer,
            },
        )
        .unwrap();
        Harness {
            engine,
            events,
            connector,
            actuator,
        }
    }

    fn tool_call(calls: serde_json::Value) -> String {
        json!({"toolCall": {"functionCalls": calls}}).to_string()
    }

    async fn wait_for_reports(events: &mut mpsc::UnboundedReceiver<SessionEvent>, n: usize) {
        let mut seen = 0;
        while seen < n {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(SessionEvent::ActionReported { .. })) => seen += 1,
                Ok(Some(_)) => {}
                other => panic!("event stream ended early: {other:?}"),
            }
        }
    }

    fn tool_responses(written: &[String]) -> Vec<serde_json::Value> {
        written
            .iter()
            .filter_map(|f| serde_json::from_str::<serde_json::Value>(f).ok())
            .filter_map(|v| v.get("tool_response").cloned())
            .flat_map(|r| r["function_responses"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn rejected_setup_fails_without_retry() {
        let h = harness(
            &config(3),
            vec![ScriptedConnection::open(vec![r#"{"error":{"message":"bad schema"}}"#], false)],
            ScriptedAnalyzer::failing(),
            None,
        );
        let handle = h.engine.handle();
        let err = h.engine.run().await.unwrap_err();

        assert!(matches!(err, DeskPilotError::SetupRejected(ref m) if m == "bad schema"));
        assert_eq!(h.connector.connects(), 1);
        assert_eq!(handle.state(), ConnectionState::Failed);
        assert!(handle.is_stopped());

        let written = h.connector.written();
        let setup: serde_json::Value = serde_json::from_str(&written[0]).unwrap();
        assert_eq!(setup["setup"]["tools"][0]["function_declarations"][0]["name"], COMPUTER_ACTION);
        assert_eq!(setup["setup"]["system_instruction"]["parts"][0]["text"], "be brief");
    }

    #[tokio::test]
    async fn setup_timeout_on_first_connect_is_fatal() {
        let h = harness(&config(3), vec![ScriptedConnection::open(vec![], false)], ScriptedAnalyzer::failing(), None);
        let err = h.engine.run().await.unwrap_err();
        assert!(matches!(err, DeskPilotError::SetupTimeout(200)));
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn every_tool_call_gets_exactly_one_response() {
        let calls = tool_call(json!([
            {"name": COMPUTER_ACTION, "id": "a1", "args": {"action": "type", "text": "hi", "reasoning": "greet"}},
            {"name": "delete_everything", "id": "a2", "args": {}},
            {"name": COMPUTER_ACTION, "id": "a3", "args": "{\"action\":\"click\",\"element_id\":9}"},
            {"name": COMPUTER_ACTION, "id": "a4", "args": {"action": "teleport"}},
        ]));
        let mut h = harness(
            &config(0),
            vec![ScriptedConnection::open(vec![ACK, "garbage", r#"{"usageMetadata":{}}"#, calls.as_str()], false)],
            ScriptedAnalyzer::failing(),
            None,
        );
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        wait_for_reports(&mut h.events, 4).await;
        handle.stop();
        run.await.unwrap().unwrap();

        let responses = tool_responses(&h.connector.written());
        let ids: Vec<_> = responses.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3", "a4"]);
        let ok: Vec<_> = responses.iter().map(|r| r["response"]["result"]["success"].as_bool().unwrap()).collect();
        assert_eq!(ok, vec![true, false, false, false]);
        assert!(responses[2]["response"]["result"]["error"].as_str().unwrap().contains("element 9"));
        assert_eq!(h.actuator.inputs(), vec![Input::Type("hi".into())]);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn complex_task_runs_plan_inside_task_scope() {
        let calls = tool_call(json!([{
            "name": COMPUTER_ACTION,
            "id": "t1",
            "args": {"action": "complex_task", "text": "click sign in then type alice", "reasoning": "log in"}
        }]));
        let analyzer = ScriptedAnalyzer::always(capture_of(vec![el("button", "Sign in", (10, 10, 90, 30), true)]));
        let mut h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK, calls.as_str()], false)], analyzer, None);
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        wait_for_reports(&mut h.events, 1).await;
        handle.stop();
        run.await.unwrap().unwrap();

        assert_eq!(h.actuator.inputs(), vec![Input::Click(50, 20), Input::Type("alice".into())]);
        let responses = tool_responses(&h.connector.written());
        let body = &responses[0]["response"];
        assert_eq!(body["result"], json!({"success": true, "steps": 2}));
        assert_eq!(body["context"]["task_stack"], json!([]));
        assert_eq!(body["context"]["session_state"]["last_task"], "click sign in then type alice");
        assert_eq!(body["context"]["session_state"]["last_task_outcome"], "success");
    }

    #[tokio::test]
    async fn failed_validation_midway_aborts_the_rest_of_the_plan() {
        // press escape, then a search with no input field on screen (navigate
        // + validation), then a scroll that must never run
        let calls = tool_call(json!([{
            "name": COMPUTER_ACTION,
            "id": "t2",
            "args": {"action": "complex_task", "text": "press escape then search for cats then scroll down"}
        }]));
        let analyzer = ScriptedAnalyzer::always(capture_of(vec![el("button", "Sign in", (10, 10, 90, 30), true)]));
        let mut h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK, calls.as_str()], false)], analyzer, None);
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        wait_for_reports(&mut h.events, 1).await;
        handle.stop();
        run.await.unwrap().unwrap();

        let inputs = h.actuator.inputs();
        assert_eq!(inputs.first(), Some(&Input::Press("escape".into())));
        assert!(inputs.contains(&Input::Type("https://www.google.com/search?q=cats".into())));
        assert!(!inputs.iter().any(|i| matches!(i, Input::Scroll(..))));

        let responses = tool_responses(&h.connector.written());
        assert_eq!(responses.len(), 1);
        let body = &responses[0]["response"];
        assert_eq!(body["result"]["success"], false);
        assert!(body["result"]["error"].as_str().unwrap().contains("wait_for_element_text:cats"));
        assert_eq!(body["context"]["task_stack"], json!([]));
        assert_eq!(body["context"]["session_state"]["last_task_outcome"], "failed");
    }

    #[tokio::test]
    async fn undecodable_call_entries_still_get_answered() {
        let calls = tool_call(json!([
            {"name": COMPUTER_ACTION, "id": "good", "args": {"action": "wait", "duration_ms": 0}},
            {"id": "nameless", "args": {}},
            {"name": COMPUTER_ACTION, "args": {"action": "wait"}},
        ]));
        let mut h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK, calls.as_str()], false)], ScriptedAnalyzer::failing(), None);
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        wait_for_reports(&mut h.events, 2).await;
        handle.stop();
        run.await.unwrap().unwrap();

        let responses = tool_responses(&h.connector.written());
        let answered: Vec<_> = responses
            .iter()
            .map(|r| (r["id"].as_str().unwrap().to_string(), r["response"]["result"]["success"].as_bool().unwrap()))
            .collect();
        assert_eq!(answered, vec![("good".to_string(), true), ("nameless".to_string(), false)]);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_wait() {
        let calls = tool_call(json!([
            {"name": COMPUTER_ACTION, "id": "w1", "args": {"action": "wait", "duration_ms": 600_000}},
        ]));
        let h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK, calls.as_str()], false)], ScriptedAnalyzer::failing(), None);
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        assert_eq!(handle.wait_ready().await, ConnectionState::Active);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("session should end promptly after stop")
            .unwrap()
            .unwrap();

        let responses = tool_responses(&h.connector.written());
        assert_eq!(responses[0]["id"], "w1");
        assert_eq!(responses[0]["response"]["result"]["success"], false);
    }

    #[tokio::test]
    async fn turn_complete_sends_screenshot_and_model_text_is_surfaced() {
        let turn = r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Opening it now."}]},"turnComplete":true}}"#;
        let capturer: Arc<dyn ScreenCapturer> = Arc::new(StaticCapturer);
        let mut h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK, turn], false)], ScriptedAnalyzer::failing(), Some(capturer));
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        let mut saw_text = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), h.events.recv()).await {
                Ok(Some(SessionEvent::ModelText(t))) => saw_text = t == "Opening it now.",
                Ok(Some(SessionEvent::TurnComplete)) => break,
                Ok(Some(_)) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        handle.stop();
        run.await.unwrap().unwrap();

        assert!(saw_text);
        let media: Vec<_> = h.connector.written().into_iter().filter(|f| f.contains("realtime_input")).collect();
        assert_eq!(media.len(), 1);
        assert!(media[0].contains("image/jpeg"));
    }

    #[tokio::test]
    async fn transport_loss_exhausts_reconnects_then_fails() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let h = harness(
            &config(2),
            vec![
                ScriptedConnection::open(vec![ACK], true),
                ScriptedConnection::refused(),
                ScriptedConnection::refused(),
            ],
            ScriptedAnalyzer::failing(),
            None,
        );
        let engine = h.engine.on_reconnect(Arc::new(move |o: &ReconnectOutcome| {
            seen.lock().unwrap().push(o.clone());
        }));
        let handle = engine.handle();

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, DeskPilotError::Transport(_)));
        assert_eq!(h.connector.connects(), 3);
        assert_eq!(handle.state(), ConnectionState::Failed);
        assert!(handle.is_stopped());
        let outcomes = outcomes.lock().unwrap().clone();
        assert!(matches!(outcomes.as_slice(), [ReconnectOutcome::Exhausted { attempts: 2, .. }]));
    }

    #[tokio::test]
    async fn reconnect_restores_session_and_visits_legal_states() {
        let mut h = harness(
            &config(3),
            vec![
                ScriptedConnection::open(vec![ACK], true),
                ScriptedConnection::refused(),
                ScriptedConnection::open(vec![ACK], false),
            ],
            ScriptedAnalyzer::failing(),
            None,
        );
        let handle = h.engine.handle();
        let run = tokio::spawn(h.engine.run());

        let mut states = vec![ConnectionState::Disconnected];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), h.events.recv()).await {
                Ok(Some(SessionEvent::StateChanged(s))) => states.push(s),
                Ok(Some(SessionEvent::Reconnect(outcome))) => {
                    assert_eq!(outcome, ReconnectOutcome::Restored { attempts: 2 });
                    break;
                }
                Ok(Some(_)) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        handle.stop();
        run.await.unwrap().unwrap();

        for pair in states.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert_eq!(h.connector.connects(), 3);
    }

    #[tokio::test]
    async fn send_text_requires_active_connection() {
        let h = harness(&config(0), vec![ScriptedConnection::open(vec![ACK], false)], ScriptedAnalyzer::failing(), None);
        let handle = h.engine.handle();
        assert!(handle.send_text("too early").await.is_err());

        let run = tokio::spawn(h.engine.run());
        assert_eq!(handle.wait_ready().await, ConnectionState::Active);
        handle.send_text("open spotify").await.unwrap();
        handle.stop();
        run.await.unwrap().unwrap();

        let written = h.connector.written();
        let content: serde_json::Value = serde_json::from_str(&written[1]).unwrap();
        let parts = &content["client_content"]["turns"][0]["parts"];
        assert_eq!(parts[0]["text"], "open spotify");
        assert_eq!(parts[1]["context"]["task_stack"], json!([]));
        assert_eq!(parts[1]["context"]["screen"]["summary"]["element_count"], 0);
    }
}
