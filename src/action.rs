use serde::{Deserialize, Serialize};

use crate::errors::ActionError;

/// Where a pointer action lands: an element of the current snapshot, or a raw point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClickTarget {
    Element { element_id: u32 },
    Point { x: i32, y: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

pub const DEFAULT_SCROLL_AMOUNT: i32 = 3;
/// Largest scroll, in wheel notches, a single action may request.
pub const MAX_SCROLL_AMOUNT: i32 = 100;
pub const DEFAULT_WAIT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Click { target: ClickTarget },
    Hover { target: ClickTarget },
    Type { text: String },
    Press { key: String },
    Scroll { direction: ScrollDirection, amount: i32 },
    Wait { duration_ms: u64 },
    Navigate { url: String },
    LaunchApp { name: String },
    ComplexTask { description: String },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Click { .. } => "click",
            ActionKind::Hover { .. } => "hover",
            ActionKind::Type { .. } => "type",
            ActionKind::Press { .. } => "press",
            ActionKind::Scroll { .. } => "scroll",
            ActionKind::Wait { .. } => "wait",
            ActionKind::Navigate { .. } => "navigate",
            ActionKind::LaunchApp { .. } => "launch_app",
            ActionKind::ComplexTask { .. } => "complex_task",
        }
    }
}

/// One primitive (or composite) action. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind, reasoning: impl Into<String>) -> Self {
        Self {
            kind,
            reasoning: reasoning.into(),
            validation: None,
        }
    }

    pub fn with_validation(mut self, predicate: impl Into<String>) -> Self {
        self.validation = Some(predicate.into());
        self
    }

    pub fn is_complex(&self) -> bool {
        matches!(self.kind, ActionKind::ComplexTask { .. })
    }

    /// Builds an action from `execute_computer_action` arguments. The remote
    /// side sometimes sends the arguments object JSON-encoded inside a string.
    pub fn from_args(args: &serde_json::Value) -> Result<Self, ActionError> {
        let raw: RawArgs = match args {
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
        .map_err(|e| ActionError::InvalidArguments(e.to_string()))?;
        raw.into_action()
    }
}

/// Flat argument shape of the declared function.
#[derive(Debug, Default, Deserialize)]
struct RawArgs {
    action: String,
    #[serde(default)]
    x: Option<i32>,
    #[serde(default)]
    y: Option<i32>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    element_id: Option<serde_json::Value>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    amount: Option<i32>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    validation: Option<String>,
}

impl RawArgs {
    fn target(&self) -> Result<ClickTarget, ActionError> {
        if let Some(id) = &self.element_id {
            let parsed = match id {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            };
            return parsed
                .and_then(|n| u32::try_from(n).ok())
                .map(|element_id| ClickTarget::Element { element_id })
                .ok_or_else(|| ActionError::InvalidArguments(format!("bad element_id: {id}")));
        }
        match (self.x, self.y) {
            (Some(x), Some(y)) => Ok(ClickTarget::Point { x, y }),
            _ => Err(ActionError::InvalidArguments(
                "pointer action needs element_id or x,y".into(),
            )),
        }
    }

    fn required_text(&self, what: &str) -> Result<String, ActionError> {
        match self.text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(ActionError::InvalidArguments(format!("{what} requires `text`"))),
        }
    }

    fn into_action(self) -> Result<Action, ActionError> {
        let kind = match self.action.as_str() {
            "click" => ActionKind::Click { target: self.target()? },
            "hover" | "moveTo" | "move_to" => ActionKind::Hover { target: self.target()? },
            "type" => ActionKind::Type {
                text: self.text.clone().unwrap_or_default(),
            },
            "press" => ActionKind::Press {
                key: self
                    .key
                    .clone()
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| ActionError::InvalidArguments("press requires `key`".into()))?,
            },
            "scroll" => {
                let dir = self.direction.as_deref().unwrap_or("down");
                ActionKind::Scroll {
                    direction: ScrollDirection::parse(dir).ok_or_else(|| {
                        ActionError::InvalidArguments(format!("bad scroll direction: {dir}"))
                    })?,
                    amount: scroll_amount(self.amount)?,
                }
            }
            "wait" => ActionKind::Wait {
                duration_ms: self.duration_ms.unwrap_or(DEFAULT_WAIT_MS),
            },
            "navigate" => ActionKind::Navigate {
                url: self.required_text("navigate")?,
            },
            "launch_app" => ActionKind::LaunchApp {
                name: self.required_text("launch_app")?,
            },
            "complex_task" => ActionKind::ComplexTask {
                description: self.required_text("complex_task")?,
            },
            other => {
                return Err(ActionError::InvalidArguments(format!(
                    "unknown action kind: {other}"
                )))
            }
        };
        Ok(Action {
            kind,
            reasoning: self.reasoning.unwrap_or_default(),
            validation: self.validation.filter(|v| !v.trim().is_empty()),
        })
    }
}

fn scroll_amount(amount: Option<i32>) -> Result<i32, ActionError> {
    match amount {
        None => Ok(DEFAULT_SCROLL_AMOUNT),
        Some(n) if (1..=MAX_SCROLL_AMOUNT).contains(&n) => Ok(n),
        Some(n) => Err(ActionError::InvalidArguments(format!(
            "scroll amount {n} outside 1..={MAX_SCROLL_AMOUNT}"
        ))),
    }
}
