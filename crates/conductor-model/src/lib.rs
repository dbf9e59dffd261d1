//! Default completion backend speaking the OpenAI-compatible
//! chat-completions wire format
//!
//! Any provider exposing that format (or a gateway translating to it) can
//! sit behind this client. Overload responses are classified separately
//! from other failures so the engine can apply its bounded retry.

use async_trait::async_trait;
use conductor_core::{
    CanonicalTool, ChatMessage, CompletionBackend, CompletionReply, ConductorError, Result, Role,
    ToolCallRequest,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .build()
            .map_err(|e| ConductorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatClient {
    async fn complete(
        &self,
        model: &str,
        conversation: &[ChatMessage],
        tools: Option<&[CanonicalTool]>,
    ) -> Result<CompletionReply> {
        let body = build_request_body(model, conversation, tools, self.max_tokens);
        debug!(
            model,
            messages = conversation.len(),
            tools = tools.map(<[CanonicalTool]>::len).unwrap_or(0),
            "submitting completion request"
        );

        let mut request = self.http.post(self.completions_url()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConductorError::Completion(format!("provider request failed: {e}")))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ConductorError::Completion(format!("provider response failed: {e}")))?;

        if status >= 400 {
            return Err(classify_failure(status, &text));
        }

        let payload: Value = serde_json::from_str(&text)?;
        parse_reply(&payload)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the conversation and tool set into a chat-completions request.
pub fn build_request_body(
    model: &str,
    conversation: &[ChatMessage],
    tools: Option<&[CanonicalTool]>,
    max_tokens: u32,
) -> Value {
    let messages: Vec<Value> = conversation
        .iter()
        .map(|message| {
            let mut entry = json!({
                "role": role_name(message.role),
                "content": message.content,
            });
            if !message.tool_calls.is_empty() {
                entry["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                }
                            })
                        })
                        .collect(),
                );
            }
            if let Some(call_id) = &message.tool_call_id {
                entry["tool_call_id"] = json!(call_id);
            }
            entry
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
    });

    if let Some(tools) = tools {
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
    }

    body
}

/// Unwrap a chat-completions response into the engine's reply shape.
pub fn parse_reply(payload: &Value) -> Result<CompletionReply> {
    let message = payload
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| {
            ConductorError::Completion("provider response missing choices[0].message".to_string())
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?.to_string();
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = match function.get("arguments") {
                        Some(Value::String(raw)) => {
                            serde_json::from_str(raw).unwrap_or_else(|_| {
                                warn!("tool call '{name}' carried unparseable arguments");
                                json!({})
                            })
                        }
                        Some(value) => value.clone(),
                        None => json!({}),
                    };
                    Some(ToolCallRequest {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionReply {
        content,
        tool_calls,
    })
}

/// Separate the retryable overload class from terminal provider failures.
fn classify_failure(status: u16, body: &str) -> ConductorError {
    let excerpt: String = body.chars().take(300).collect();
    let overloaded = matches!(status, 429 | 503 | 529)
        || (status >= 500 && excerpt.to_ascii_lowercase().contains("overloaded"));
    if overloaded {
        ConductorError::Overloaded(format!("HTTP {status}: {excerpt}"))
    } else {
        ConductorError::Completion(format!("HTTP {status}: {excerpt}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shapes_tools() {
        let conversation = vec![ChatMessage::user("list my repos")];
        let tools = vec![CanonicalTool {
            name: "github__list_repos".to_string(),
            description: "[github] List repositories".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }];

        let body = build_request_body("gpt-test", &conversation, Some(&tools), 4096);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "github__list_repos");
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["type"],
            "object"
        );
    }

    #[test]
    fn test_request_body_serializes_tool_results() {
        let conversation = vec![
            ChatMessage::assistant_with_calls(
                "",
                vec![ToolCallRequest {
                    id: "call_1".to_string(),
                    name: "svc__do".to_string(),
                    arguments: json!({"x": 1}),
                }],
            ),
            ChatMessage::tool_result("call_1", "{\"ok\":true}"),
        ];

        let body = build_request_body("m", &conversation, None, 4096);
        let assistant = &body["messages"][0];
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        // Arguments ride as a JSON string per the wire format.
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"],
            "{\"x\":1}"
        );
        let tool = &body["messages"][1];
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_parse_reply_with_tool_calls() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {
                            "name": "svc__search",
                            "arguments": "{\"q\":\"rust\"}"
                        }
                    }]
                }
            }]
        });

        let reply = parse_reply(&payload).unwrap();
        assert!(reply.has_tool_calls());
        assert_eq!(reply.tool_calls[0].id, "call_9");
        assert_eq!(reply.tool_calls[0].arguments["q"], "rust");
        assert!(reply.content.is_none());
    }

    #[test]
    fn test_parse_reply_text_only() {
        let payload = json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        let reply = parse_reply(&payload).unwrap();
        assert!(!reply.has_tool_calls());
        assert_eq!(reply.text(), "hello");
    }

    #[test]
    fn test_unparseable_arguments_default_to_empty_object() {
        let payload = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "c",
                        "function": {"name": "svc__t", "arguments": "{broken"}
                    }]
                }
            }]
        });
        let reply = parse_reply(&payload).unwrap();
        assert_eq!(reply.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn test_missing_choices_is_completion_error() {
        let error = parse_reply(&json!({})).unwrap_err();
        assert!(matches!(error, ConductorError::Completion(_)));
    }

    #[test]
    fn test_overload_classification() {
        assert!(classify_failure(429, "rate limited").is_overloaded());
        assert!(classify_failure(529, "").is_overloaded());
        assert!(classify_failure(500, "model overloaded, try later").is_overloaded());
        assert!(!classify_failure(400, "bad request").is_overloaded());
        assert!(!classify_failure(500, "internal error").is_overloaded());
    }
}
