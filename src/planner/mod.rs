/// Rule-based expansion of composite tasks into primitive action plans, and
/// post-condition checks for executed steps.
pub mod rules;

use crate::action::Action;
use crate::perception::ScreenContext;

/// The only predicate form currently understood.
pub const WAIT_FOR_TEXT_PREFIX: &str = "wait_for_element_text:";

/// Ordered steps for one composite task. Consumed by the runner; a plan is
/// never restarted once execution begins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: Vec<Action>,
}

impl Plan {
    pub fn new(steps: Vec<Action>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Action] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// An empty plan means "nothing to do", which is not a failure.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<Action> {
        self.steps
    }
}

pub struct ActionPlanner {
    rules: rules::RuleSet,
}

impl Default for ActionPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionPlanner {
    pub fn new() -> Self {
        Self {
            rules: rules::RuleSet::new(),
        }
    }

    /// Deterministic decomposition of `task` against the snapshot it will
    /// start on. Returns an empty plan when any part of the task is unmatched.
    pub fn create_plan(&self, task: &str, context: &ScreenContext) -> Plan {
        let empty = ScreenContext::empty();
        let mut steps = Vec::new();

        for (idx, segment) in self.rules.segments(task).into_iter().enumerate() {
            // only the first segment runs against `context`; later ones must
            // not carry element ids across the snapshots in between
            let snapshot = if idx == 0 { context } else { &empty };
            match self.rules.expand(segment, snapshot) {
                Some(mut expanded) => steps.append(&mut expanded),
                None => {
                    tracing::info!(task = %task, segment = %segment, "no planning rule matched");
                    return Plan::default();
                }
            }
        }

        tracing::debug!(task = %task, steps = steps.len(), "plan created");
        Plan::new(steps)
    }

    /// Checks a step's post-condition against a fresh snapshot. No predicate
    /// passes; unrecognised predicate syntax fails closed.
    pub fn validate_step(&self, predicate: Option<&str>, context: &ScreenContext) -> bool {
        let Some(predicate) = predicate else {
            return true;
        };
        match predicate.strip_prefix(WAIT_FOR_TEXT_PREFIX) {
            Some(expected) => {
                let expected = expected.to_lowercase();
                context
                    .elements()
                    .iter()
                    .any(|e| !e.text.is_empty() && e.text.to_lowercase().contains(&expected))
            }
            None => {
                tracing::warn!(predicate = %predicate, "unrecognised validation predicate");
                false
            }
        }
    }
}
