use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::agent_engine::history::{ActionHistory, HistoryEntry};
use crate::perception::ScreenDigest;

/// Validation awaiting a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingValidation {
    pub action: String,
    pub predicate: String,
}

/// Per-session mutable state. Owned by the engine; the planner and dispatcher
/// only see it through explicit `&mut` handles on the dispatch path.
pub struct SessionContext {
    task_stack: Vec<String>,
    session_state: serde_json::Map<String, serde_json::Value>,
    history: ActionHistory,
    pending_validations: VecDeque<PendingValidation>,
}

impl SessionContext {
    pub fn new(history: ActionHistory) -> Self {
        Self {
            task_stack: Vec::new(),
            session_state: serde_json::Map::new(),
            history,
            pending_validations: VecDeque::new(),
        }
    }

    pub fn task_stack(&self) -> &[String] {
        &self.task_stack
    }

    pub fn current_task(&self) -> Option<&str> {
        self.task_stack.last().map(String::as_str)
    }

    /// Pushes `description` and returns a guard that restores the stack top
    /// when dropped, on every exit path.
    pub fn enter_task(&mut self, description: impl Into<String>) -> TaskScope<'_> {
        let depth = self.task_stack.len();
        let description = description.into();
        tracing::debug!(task = %description, depth = depth + 1, "task pushed");
        self.task_stack.push(description);
        TaskScope { ctx: self, depth }
    }

    pub fn state(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.session_state
    }

    pub fn get_state(&self, key: &str) -> Option<&serde_json::Value> {
        self.session_state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.session_state.insert(key.into(), value.into());
    }

    pub fn remove_state(&mut self, key: &str) -> Option<serde_json::Value> {
        self.session_state.remove(key)
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn queue_validation(&mut self, pending: PendingValidation) {
        self.pending_validations.push_back(pending);
    }

    pub fn resolve_validation(&mut self) -> Option<PendingValidation> {
        self.pending_validations.pop_front()
    }

    pub fn pending_validations(&self) -> impl Iterator<Item = &PendingValidation> {
        self.pending_validations.iter()
    }

    /// `{taskStack, sessionState}` as carried by every tool response.
    pub fn response_context(&self) -> serde_json::Value {
        serde_json::json!({
            "task_stack": self.task_stack,
            "session_state": self.session_state,
        })
    }

    /// Full outbound view: stack, state, the last `recent` actions, and an
    /// optional screen digest.
    pub fn snapshot(&self, recent: usize, screen: Option<ScreenDigest>) -> ContextSnapshot {
        ContextSnapshot {
            task_stack: self.task_stack.clone(),
            session_state: self.session_state.clone(),
            recent_actions: self
                .history
                .recent(recent)
                .into_iter()
                .map(|e| RecentAction {
                    action: e.action.kind.name().to_string(),
                    success: e.success,
                    reasoning: e.reasoning,
                    error: e.error,
                })
                .collect(),
            pending_validations: self.pending_validations.iter().cloned().collect(),
            screen,
        }
    }
}

/// Scoped task-stack entry. Derefs to the session so the task body can keep
/// using it; pops back to the entry depth on drop.
pub struct TaskScope<'a> {
    ctx: &'a mut SessionContext,
    depth: usize,
}

impl Deref for TaskScope<'_> {
    type Target = SessionContext;

    fn deref(&self) -> &SessionContext {
        self.ctx
    }
}

impl DerefMut for TaskScope<'_> {
    fn deref_mut(&mut self) -> &mut SessionContext {
        self.ctx
    }
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        self.ctx.task_stack.truncate(self.depth);
        tracing::debug!(depth = self.depth, "task popped");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentAction {
    pub action: String,
    pub success: bool,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Read-only view published to input producers after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub task_stack: Vec<String>,
    pub session_state: serde_json::Map<String, serde_json::Value>,
    pub recent_actions: Vec<RecentAction>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pending_validations: Vec<PendingValidation>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub screen: Option<ScreenDigest>,
}
