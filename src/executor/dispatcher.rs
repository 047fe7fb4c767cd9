use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionKind, ClickTarget};
use crate::agent_engine::context::SessionContext;
use crate::agent_engine::history::HistoryEntry;
use crate::config::ExecutorConfig;
use crate::errors::ActionError;
use crate::executor::input::Actuator;
use crate::perception::{capture_or_empty, ScreenAnalyzer, ScreenContext};

const RUN_DIALOG_CHORD: &str = "win+r";
const ADDRESS_BAR_CHORD: &str = "ctrl+l";

/// Executes one primitive action against the live screen and records it.
pub struct ActionDispatcher {
    analyzer: Arc<dyn ScreenAnalyzer>,
    actuator: Arc<dyn Actuator>,
    config: ExecutorConfig,
    stop: CancellationToken,
}

impl ActionDispatcher {
    pub fn new(
        analyzer: Arc<dyn ScreenAnalyzer>,
        actuator: Arc<dyn Actuator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            analyzer,
            actuator,
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Lets a session stop request cut a `wait` short.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn analyzer(&self) -> &dyn ScreenAnalyzer {
        self.analyzer.as_ref()
    }

    /// Runs `action` and appends it to the session history whatever the
    /// outcome. Element ids resolve against a snapshot taken here, never a
    /// cached one.
    pub async fn execute(
        &self,
        action: &Action,
        session: &mut SessionContext,
    ) -> Result<(), ActionError> {
        let screen = capture_or_empty(self.analyzer.as_ref()).await;
        tracing::info!(action = action.kind.name(), reasoning = %action.reasoning, "executing action");

        let outcome = self.perform(action, &screen, session).await;

        session.record(HistoryEntry {
            ts: chrono::Utc::now().timestamp_millis(),
            action: action.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            reasoning: action.reasoning.clone(),
            screen: screen.summary(),
        });

        match &outcome {
            Ok(()) => tracing::info!(action = action.kind.name(), "action succeeded"),
            Err(e) => tracing::warn!(action = action.kind.name(), error = %e, "action failed"),
        }
        outcome
    }

    async fn perform(
        &self,
        action: &Action,
        screen: &ScreenContext,
        session: &mut SessionContext,
    ) -> Result<(), ActionError> {
        match &action.kind {
            ActionKind::Click { target } => {
                let (x, y) = resolve(target, screen, true)?;
                self.actuator.click(x, y).await?;
            }
            ActionKind::Hover { target } => {
                let (x, y) = resolve(target, screen, false)?;
                self.actuator.move_to(x, y).await?;
            }
            ActionKind::Type { text } => match self.config.launch_command(text) {
                Some(command) => {
                    let command = command.to_string();
                    self.open_via_run_dialog(&command).await?;
                    session.set_state("active_app", text.trim().to_lowercase());
                }
                None => self.actuator.type_text(text).await?,
            },
            ActionKind::Press { key } => self.actuator.press_key(key).await?,
            ActionKind::Scroll { direction, amount } => {
                self.actuator.scroll(*direction, *amount).await?
            }
            ActionKind::Wait { duration_ms } => {
                let ms = (*duration_ms).min(self.config.max_wait_ms);
                if ms < *duration_ms {
                    tracing::warn!(requested = duration_ms, capped = ms, "wait shortened");
                }
                // nothing is held down while waiting, so a stop ends it at once
                tokio::select! {
                    _ = self.stop.cancelled() => return Err(ActionError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
            ActionKind::Navigate { url } => {
                self.launch(&self.config.browser.clone(), session).await?;
                self.actuator.press_key(ADDRESS_BAR_CHORD).await?;
                self.actuator.type_text(url).await?;
                self.actuator.press_key("enter").await?;
                session.set_state("current_url", url.clone());
            }
            ActionKind::LaunchApp { name } => self.launch(name, session).await?,
            ActionKind::ComplexTask { .. } => return Err(ActionError::Unplanned),
        }
        Ok(())
    }

    /// Opens `name` through the run dialog and waits for its window.
    async fn launch(&self, name: &str, session: &mut SessionContext) -> Result<(), ActionError> {
        let command = self
            .config
            .launch_command(name)
            .unwrap_or(name.trim())
            .to_string();
        self.open_via_run_dialog(&command).await?;
        if self.config.launch_settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.launch_settle_ms)).await;
        }
        session.set_state("active_app", name.trim().to_lowercase());
        Ok(())
    }

    async fn open_via_run_dialog(&self, command: &str) -> Result<(), ActionError> {
        tracing::debug!(command = %command, "opening via run dialog");
        self.actuator.press_key(RUN_DIALOG_CHORD).await?;
        if self.config.run_dialog_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.run_dialog_delay_ms)).await;
        }
        self.actuator.type_text(command).await?;
        self.actuator.press_key("enter").await?;
        Ok(())
    }
}

/// Screen point for a pointer target. Element targets must exist in
/// `screen`; clicks additionally require a clickable element.
fn resolve(
    target: &ClickTarget,
    screen: &ScreenContext,
    require_clickable: bool,
) -> Result<(i32, i32), ActionError> {
    match target {
        ClickTarget::Point { x, y } => Ok((*x, *y)),
        ClickTarget::Element { element_id } => {
            let element = screen
                .element(*element_id)
                .ok_or(ActionError::ElementNotFound(*element_id))?;
            if require_clickable && !element.clickable {
                return Err(ActionError::ElementNotClickable(*element_id));
            }
            Ok(element.bbox.center())
        }
    }
}
