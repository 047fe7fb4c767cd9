pub mod action;
pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod input;
pub mod perception;
pub mod planner;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent_engine::engine::{EngineParts, ProtocolEngine};
use crate::agent_engine::state::{ReconnectOutcome, SessionEvent};
use crate::config::{AppConfig, InputMode};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::executor::input::EnigoActuator;
use crate::input::text::{run_text_input, stdin_lines, LastCommand};
use crate::perception::screenshot::PrimaryMonitorCapturer;
use crate::perception::NullAnalyzer;
use crate::protocol::transport::WsConnector;

pub async fn run() -> DeskPilotResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();

    let config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load config; using defaults");
            AppConfig::default()
        }
    };
    let endpoint = config.api.endpoint()?;

    // No element-detection backend ships with the binary; screen contexts
    // stay empty until one is wired in.
    let parts = EngineParts {
        connector: Arc::new(WsConnector::new(endpoint)),
        analyzer: Arc::new(NullAnalyzer),
        actuator: Arc::new(EnigoActuator),
        capturer: Some(Arc::new(PrimaryMonitorCapturer)),
    };
    let last = LastCommand::default();
    let announcer = last.clone();
    let (engine, events) = ProtocolEngine::new(&config, parts)?;
    let engine = engine.on_reconnect(Arc::new(move |outcome: &ReconnectOutcome| {
        announcer.announce(outcome)
    }));
    let handle = engine.handle();
    let lines = stdin_lines()?;

    tracing::info!(model = %config.api.model, "starting session");
    let engine_task = tokio::spawn(engine.run());
    let printer = tokio::spawn(print_events(events));

    if config.input.mode == InputMode::Voice {
        tracing::warn!("voice input needs an audio source and transcriber; falling back to text input");
    }
    let input_task = tokio::spawn(run_text_input(handle.clone(), lines, last));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, stopping");
            handle.stop();
        }
        _ = handle.stopped() => {}
    }

    let result = engine_task
        .await
        .map_err(|e| DeskPilotError::Transport(format!("engine task ended abnormally: {e}")))?;
    match input_task.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "text input ended with error"),
        Err(e) => tracing::warn!(error = %e, "text input task ended abnormally"),
        Ok(Ok(())) => {}
    }
    let _ = printer.await;
    result
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::ModelText(text) => println!("Assistant: {text}"),
            SessionEvent::ModelAudio { mime_type, data } => {
                tracing::debug!(mime_type = %mime_type, bytes = data.len(), "model audio (no playback)")
            }
            SessionEvent::ActionReported { call_id, success, error } => {
                tracing::info!(call_id = %call_id, success, error = ?error, "action reported")
            }
            SessionEvent::StateChanged(state) => tracing::debug!(?state, "state changed"),
            SessionEvent::TurnComplete | SessionEvent::Reconnect(_) => {}
        }
    }
}
