use thiserror::Error;

/// Session-level failures. These surface to the session owner and either
/// trigger a reconnect or end the run loop.
#[derive(Debug, Error)]
pub enum DeskPilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Setup rejected: {0}")]
    SetupRejected(String),

    #[error("Setup handshake timed out after {0}ms")]
    SetupTimeout(u64),

    #[error("Screen capture error: {0}")]
    Capture(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Actuator error: {0}")]
    Actuator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Session cancelled")]
    Cancelled,
}

impl DeskPilotError {
    /// Transport-class failures are worth another connect cycle; a rejected
    /// setup never is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeskPilotError::Transport(_)
                | DeskPilotError::WebSocket(_)
                | DeskPilotError::Io(_)
                | DeskPilotError::SetupTimeout(_)
        )
    }
}

impl serde::Serialize for DeskPilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type DeskPilotResult<T> = Result<T, DeskPilotError>;

/// Failures contained inside the tool-call path. They are reported back to
/// the remote agent as a failed tool response and never end the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("element {0} not found in the current screen context")]
    ElementNotFound(u32),

    #[error("element {0} is not clickable")]
    ElementNotClickable(u32),

    #[error("validation not satisfied: {0}")]
    ValidationFailed(String),

    #[error("invalid action arguments: {0}")]
    InvalidArguments(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("complex task must be expanded by the planner before dispatch")]
    Unplanned,

    #[error("actuator failed: {0}")]
    Actuator(String),

    #[error("stopped before completion")]
    Cancelled,
}

impl From<DeskPilotError> for ActionError {
    fn from(e: DeskPilotError) -> Self {
        match e {
            DeskPilotError::Cancelled => ActionError::Cancelled,
            other => ActionError::Actuator(other.to_string()),
        }
    }
}

impl serde::Serialize for ActionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}
