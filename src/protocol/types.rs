use serde::{Deserialize, Serialize};

use crate::errors::{DeskPilotError, DeskPilotResult};

// ── Outbound ────────────────────────────────────────────────────────────────

/// Every frame the client writes. Serialises externally tagged, e.g.
/// `{"tool_response": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundFrame {
    Setup(SetupPayload),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Setup(_) => "setup",
            OutboundFrame::ClientContent(_) => "client_content",
            OutboundFrame::RealtimeInput(_) => "realtime_input",
            OutboundFrame::ToolResponse(_) => "tool_response",
        }
    }

    pub fn to_json(&self) -> DeskPilotResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// A single user turn: the typed text plus the session context it was
    /// issued against.
    pub fn user_text(text: impl Into<String>, context: serde_json::Value) -> Self {
        OutboundFrame::ClientContent(ClientContent {
            turns: vec![Turn {
                role: "user".into(),
                parts: vec![Part::Text { text: text.into() }, Part::Context { context }],
            }],
            turn_complete: true,
        })
    }

    pub fn media(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        OutboundFrame::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: mime_type.into(),
                data: data.into(),
            }],
        })
    }

    pub fn tool_response(
        id: impl Into<String>,
        name: impl Into<String>,
        result: ToolResult,
        context: serde_json::Value,
    ) -> Self {
        OutboundFrame::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                name: name.into(),
                id: id.into(),
                response: ResponseBody { result, context },
            }],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupPayload {
    pub model: String,
    pub tools: Vec<ToolSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSet {
    pub function_declarations: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    Context { context: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub name: String,
    pub id: String,
    pub response: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseBody {
    pub result: ToolResult,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of plan steps run, for composite tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
}

impl ToolResult {
    pub fn ok() -> Self {
        Self { success: true, error: None, steps: None }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self { success: false, error: Some(error.to_string()), steps: None }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = Some(steps);
        self
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub id: String,
    pub args: serde_json::Value,
}

/// A `functionCalls` entry that carries an id but cannot be decoded. It is
/// still owed a (failed) response.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenCall {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelPart {
    Text(String),
    /// Base64 media from an `inlineData` part.
    Inline { mime_type: String, data: String },
}

/// Closed view of every server frame. Downstream code matches on this and
/// never inspects raw keys.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    SetupAck,
    Error(String),
    ContentTurn { parts: Vec<ModelPart>, turn_complete: bool },
    /// Entries in arrival order. Entries without an id are already dropped.
    ToolCall(Vec<Result<FunctionCall, BrokenCall>>),
    TurnComplete,
    /// Shape not understood; carries the top-level keys for the log.
    Unrecognized(Vec<String>),
}

impl InboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::SetupAck => "setup_ack",
            InboundFrame::Error(_) => "error",
            InboundFrame::ContentTurn { .. } => "content_turn",
            InboundFrame::ToolCall(_) => "tool_call",
            InboundFrame::TurnComplete => "turn_complete",
            InboundFrame::Unrecognized(_) => "unrecognized",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    setup_complete: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    server_content: Option<RawServerContent>,
    tool_call: Option<RawToolCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<RawTurn>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct RawTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    text: Option<String>,
    inline_data: Option<RawInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolCall {
    #[serde(default)]
    function_calls: Vec<serde_json::Value>,
}

/// Decodes one text frame. Undecodable JSON is a `MalformedFrame`; decodable
/// JSON with no single known discriminator is `Unrecognized`.
pub fn parse_inbound(text: &str) -> DeskPilotResult<InboundFrame> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| DeskPilotError::MalformedFrame(format!("invalid JSON: {e}")))?;
    let keys: Vec<String> = match value.as_object() {
        Some(obj) => obj.keys().cloned().collect(),
        None => return Ok(InboundFrame::Unrecognized(Vec::new())),
    };
    let raw: RawInbound = serde_json::from_value(value)
        .map_err(|e| DeskPilotError::MalformedFrame(format!("unexpected frame layout: {e}")))?;

    let present = [
        raw.setup_complete.is_some(),
        raw.error.is_some(),
        raw.server_content.is_some(),
        raw.tool_call.is_some(),
    ]
    .into_iter()
    .filter(|p| *p)
    .count();
    if present != 1 {
        return Ok(InboundFrame::Unrecognized(keys));
    }

    if raw.setup_complete.is_some() {
        return Ok(InboundFrame::SetupAck);
    }
    if let Some(err) = raw.error {
        return Ok(InboundFrame::Error(error_message(&err)));
    }
    if let Some(call) = raw.tool_call {
        return Ok(InboundFrame::ToolCall(
            call.function_calls.into_iter().filter_map(function_call).collect(),
        ));
    }
    if let Some(content) = raw.server_content {
        return Ok(match content.model_turn {
            Some(turn) => InboundFrame::ContentTurn {
                parts: turn.parts.into_iter().filter_map(model_part).collect(),
                turn_complete: content.turn_complete,
            },
            None if content.turn_complete => InboundFrame::TurnComplete,
            None => InboundFrame::Unrecognized(keys),
        });
    }
    Ok(InboundFrame::Unrecognized(keys))
}

/// Decodes one call on its own so a bad entry cannot take its siblings down.
/// `None` when there is no id to answer to.
fn function_call(entry: serde_json::Value) -> Option<Result<FunctionCall, BrokenCall>> {
    let id = match entry.get("id").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            tracing::warn!(name = ?entry.get("name"), "function call without an id skipped");
            return None;
        }
    };
    let call = match entry.get("name").and_then(|v| v.as_str()) {
        Some(name) if !name.is_empty() => Ok(FunctionCall {
            name: name.to_string(),
            id,
            args: entry.get("args").cloned().unwrap_or_default(),
        }),
        _ => Err(BrokenCall {
            id,
            reason: "function call has no name".into(),
        }),
    };
    Some(call)
}

fn model_part(part: RawPart) -> Option<ModelPart> {
    if let Some(text) = part.text {
        return Some(ModelPart::Text(text));
    }
    part.inline_data.map(|d| ModelPart::Inline {
        mime_type: d.mime_type,
        data: d.data,
    })
}

fn error_message(err: &serde_json::Value) -> String {
    err.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}
