use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC code a conformant server returns for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("no JSON payload found in event stream")]
    MalformedStream,

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("negotiation with '{endpoint}' failed: {reason}")]
    Negotiation { endpoint: String, reason: String },

    #[error("model provider overloaded: {0}")]
    Overloaded(String),

    #[error("completion failed: {0}")]
    Completion(String),

    #[error("live connection closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Transport-level failures are contained at the scope of one call to
    /// one endpoint and never abort a turn.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConductorError::Timeout(_)
                | ConductorError::Unreachable(_)
                | ConductorError::MalformedStream
                | ConductorError::HttpStatus { .. }
        )
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, ConductorError::Rpc { code, .. } if *code == METHOD_NOT_FOUND)
    }

    /// The only failure class the engine retries automatically.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, ConductorError::Overloaded(_))
    }

    /// Whether a cached session should be discarded, forcing renegotiation
    /// on the next use of the endpoint. Servers signal expiry either as an
    /// HTTP auth status or as a -32000 error with a session/auth message.
    pub fn invalidates_session(&self) -> bool {
        match self {
            ConductorError::HttpStatus { status, .. } => *status == 401 || *status == 403,
            ConductorError::Rpc { code, message } => {
                *code == -32000 && {
                    let m = message.to_ascii_lowercase();
                    m.contains("session") || m.contains("auth") || m.contains("expired")
                }
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Model-issued call id; results are correlated by it.
    pub id: String,
    /// Qualified tool name as presented to the model.
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool-result message keyed by the model-issued call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Outcome of one model-completion call: assistant text, tool-invocation
/// requests, or both.
#[derive(Debug, Clone, Default)]
pub struct CompletionReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl CompletionReply {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

/// The flattened, provider-ready tool shape handed to the completion
/// boundary. Name is ≤128 chars over [A-Za-z0-9_-] and unique per turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The model-completion boundary. Implementations must report a transient
/// overload condition as `ConductorError::Overloaded` so the engine can
/// distinguish it from terminal provider failures.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        conversation: &[ChatMessage],
        tools: Option<&[CanonicalTool]>,
    ) -> Result<CompletionReply>;
}

/// One chat request arriving on the live connection: the user message, the
/// endpoints selected for this turn, and the model to drive it with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub model: String,
}

/// Events written to the live connection. These are the only points at
/// which the engine touches the outside world during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        message: String,
    },
    ToolCall {
        server: String,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        server: String,
        tool: String,
        result: Value,
    },
    Message {
        role: Role,
        content: String,
        model: String,
    },
    Error {
        message: String,
    },
}

/// Ordered, reliable event channel to the live client connection.
///
/// An `Err(ConnectionClosed)` from `emit` means the client is gone; the
/// engine finishes in-flight work, discards results, and starts no new
/// round.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SessionEvent) -> Result<()>;
}
