// Sequential plan execution with per-step settle delay and post-condition checks.
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::agent_engine::context::{PendingValidation, SessionContext};
use crate::errors::ActionError;
use crate::executor::dispatcher::ActionDispatcher;
use crate::perception::capture_or_empty;
use crate::planner::{ActionPlanner, Plan};

/// Shared pieces a plan run needs besides the session itself.
pub struct StepRunner<'a> {
    pub dispatcher: &'a ActionDispatcher,
    pub planner: &'a ActionPlanner,
    pub step_delay: Duration,
    pub stop: &'a CancellationToken,
}

impl StepRunner<'_> {
    /// Executes `plan` in order, stopping at the first failure. Returns the
    /// number of steps that ran. A stop request is honoured between steps,
    /// never in the middle of one.
    pub async fn run_plan(
        &self,
        plan: Plan,
        session: &mut SessionContext,
    ) -> Result<usize, ActionError> {
        let total = plan.len();
        for (idx, step) in plan.into_steps().into_iter().enumerate() {
            if idx > 0 && self.stop.is_cancelled() {
                tracing::info!(completed = idx, total, "plan interrupted by stop request");
                return Err(ActionError::Cancelled);
            }
            tracing::debug!(step = idx + 1, total, action = step.kind.name(), "plan step");
            self.run_step(&step, session).await?;
        }
        Ok(total)
    }

    /// Dispatches one action, lets the UI settle, then checks its
    /// validation (if any) against a fresh snapshot.
    pub async fn run_step(
        &self,
        step: &Action,
        session: &mut SessionContext,
    ) -> Result<(), ActionError> {
        self.dispatcher.execute(step, session).await?;
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }

        let Some(predicate) = step.validation.as_deref() else {
            return Ok(());
        };
        session.queue_validation(PendingValidation {
            action: step.kind.name().to_string(),
            predicate: predicate.to_string(),
        });
        let screen = capture_or_empty(self.dispatcher.analyzer()).await;
        let passed = self.planner.validate_step(Some(predicate), &screen);
        session.resolve_validation();

        if passed {
            Ok(())
        } else {
            tracing::warn!(action = step.kind.name(), predicate = %predicate, "validation failed");
            Err(ActionError::ValidationFailed(predicate.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::action::ActionKind;
    use crate::agent_engine::history::ActionHistory;
    use crate::testing::{capture_of, el, fast_executor_config, Input, RecordingActuator, ScriptedAnalyzer};

    fn typed(text: &str) -> Action {
        Action::new(ActionKind::Type { text: text.into() }, "")
    }

    #[tokio::test]
    async fn failed_validation_stops_the_plan() {
        let analyzer = ScriptedAnalyzer::always(capture_of(vec![el("text", "Inbox", (0, 0, 50, 20), false)]));
        let actuator = Arc::new(RecordingActuator::default());
        let dispatcher = ActionDispatcher::new(Arc::new(analyzer), actuator.clone(), fast_executor_config());
        let planner = ActionPlanner::new();
        let stop = CancellationToken::new();
        let runner = StepRunner { dispatcher: &dispatcher, planner: &planner, step_delay: Duration::ZERO, stop: &stop };
        let mut session = SessionContext::new(ActionHistory::new(10));

        let plan = Plan::new(vec![
            typed("a").with_validation("wait_for_element_text:inbox"),
            typed("b").with_validation("wait_for_element_text:Results"),
            typed("c"),
        ]);
        let err = runner.run_plan(plan, &mut session).await.unwrap_err();

        assert_eq!(err, ActionError::ValidationFailed("wait_for_element_text:Results".into()));
        assert_eq!(actuator.inputs(), vec![Input::Type("a".into()), Input::Type("b".into())]);
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.pending_validations().count(), 0);
    }

    #[tokio::test]
    async fn stop_request_is_checked_between_steps() {
        let actuator = Arc::new(RecordingActuator::default());
        let dispatcher =
            ActionDispatcher::new(Arc::new(ScriptedAnalyzer::failing()), actuator.clone(), fast_executor_config());
        let planner = ActionPlanner::new();
        let stop = CancellationToken::new();
        stop.cancel();
        let runner = StepRunner { dispatcher: &dispatcher, planner: &planner, step_delay: Duration::ZERO, stop: &stop };
        let mut session = SessionContext::new(ActionHistory::new(10));

        let err = runner
            .run_plan(Plan::new(vec![typed("first"), typed("second")]), &mut session)
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::Cancelled);
        assert_eq!(actuator.inputs(), vec![Input::Type("first".into())]);
    }

    #[tokio::test]
    async fn empty_plan_runs_nothing() {
        let actuator = Arc::new(RecordingActuator::default());
        let dispatcher =
            ActionDispatcher::new(Arc::new(ScriptedAnalyzer::failing()), actuator.clone(), fast_executor_config());
        let planner = ActionPlanner::new();
        let stop = CancellationToken::new();
        let runner = StepRunner { dispatcher: &dispatcher, planner: &planner, step_delay: Duration::ZERO, stop: &stop };
        let mut session = SessionContext::new(ActionHistory::new(10));
        assert_eq!(runner.run_plan(Plan::default(), &mut session).await, Ok(0));
        assert!(actuator.inputs().is_empty());
    }
}
