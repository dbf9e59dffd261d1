//! Multi-round execution loop
//!
//! Drives one turn: flatten the tool catalogs of the requested endpoints,
//! submit the conversation to the completion boundary, execute any
//! requested tool calls against the right endpoints, feed results back,
//! and repeat up to the round cap. Per-call and per-endpoint failures
//! degrade the turn instead of aborting it; only provider overload with
//! retries exhausted (or an unrecoverable completion failure) ends a turn
//! with an error.

use conductor_core::{
    CanonicalTool, ChatMessage, ChatRequest, CompletionBackend, CompletionReply, EventSink, Result,
    Role, SessionEvent, ToolCallRequest,
};
use conductor_mcp::{
    flatten_tools, sanitize, split_for_endpoint, Endpoint, SessionRegistry, ToolCallParams,
    ToolDescriptor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod sink;
pub use sink::ChannelSink;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum model rounds per turn before force-terminating.
    pub max_rounds: usize,
    /// Ceiling on the flattened tool count handed to the provider.
    pub max_tools: usize,
    /// Retries after the first attempt when the provider is overloaded.
    pub completion_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_tools: 50,
            completion_retries: 2,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 8_000,
        }
    }
}

type CatalogEntry = (Arc<Endpoint>, Arc<Vec<ToolDescriptor>>);

pub struct Engine {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn CompletionBackend>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn CompletionBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
        }
    }

    /// Run one turn. Returns the updated conversation; everything the
    /// client should see goes out through the sink as typed events.
    pub async fn run_turn(
        &self,
        request: &ChatRequest,
        history: Vec<ChatMessage>,
        sink: &dyn EventSink,
    ) -> Result<Vec<ChatMessage>> {
        let turn_id = Uuid::new_v4();
        info!(%turn_id, model = %request.model, endpoints = request.endpoints.len(), "starting turn");

        let mut live = true;
        let entries = self.gather_catalogs(request, sink, &mut live).await;
        let slices: Vec<(&Endpoint, &[ToolDescriptor])> = entries
            .iter()
            .map(|(endpoint, catalog)| (endpoint.as_ref(), catalog.as_slice()))
            .collect();
        let tools = flatten_tools(slices, self.config.max_tools);
        let tool_set: Option<&[CanonicalTool]> = if tools.is_empty() {
            None
        } else {
            Some(&tools)
        };

        let mut conversation = history;
        conversation.push(ChatMessage::user(request.message.as_str()));

        for round in 1..=self.config.max_rounds {
            self.emit(
                sink,
                SessionEvent::Status {
                    message: format!(
                        "Calling {} with {} tools (round {round})",
                        request.model,
                        tools.len()
                    ),
                },
                &mut live,
            )
            .await;
            if !live {
                warn!(%turn_id, "live connection closed, abandoning turn before round {round}");
                return Ok(conversation);
            }

            let reply = match self
                .complete_with_retry(&request.model, &conversation, tool_set)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    self.emit(
                        sink,
                        SessionEvent::Error {
                            message: format!("model call failed: {e}"),
                        },
                        &mut live,
                    )
                    .await;
                    return Err(e);
                }
            };

            conversation.push(ChatMessage::assistant_with_calls(
                reply.text(),
                reply.tool_calls.clone(),
            ));

            if !reply.has_tool_calls() {
                self.emit(
                    sink,
                    SessionEvent::Message {
                        role: Role::Assistant,
                        content: reply.text(),
                        model: request.model.clone(),
                    },
                    &mut live,
                )
                .await;
                info!(%turn_id, rounds = round, "turn complete");
                return Ok(conversation);
            }

            debug!(%turn_id, round, calls = reply.tool_calls.len(), "executing tool calls");
            let results = self
                .execute_round(&reply.tool_calls, &entries, sink, &mut live)
                .await;

            // Results go back in the exact order the model issued the
            // calls; the completion boundary correlates them by id and
            // position.
            for (call, result) in reply.tool_calls.iter().zip(results) {
                conversation.push(ChatMessage::tool_result(call.id.as_str(), result.to_string()));
            }

            if !live {
                warn!(%turn_id, "live connection closed mid-turn, discarding remaining rounds");
                return Ok(conversation);
            }
        }

        let notice = format!(
            "Stopped after {} rounds; the task may be incomplete.",
            self.config.max_rounds
        );
        warn!(%turn_id, "{notice}");
        self.emit(
            sink,
            SessionEvent::Message {
                role: Role::Assistant,
                content: notice.clone(),
                model: request.model.clone(),
            },
            &mut live,
        )
        .await;
        conversation.push(ChatMessage::assistant(notice));
        Ok(conversation)
    }

    /// Collect catalogs for the requested endpoints, negotiating lazily. A
    /// failing endpoint is excluded from the turn and reported; it never
    /// aborts the others.
    async fn gather_catalogs(
        &self,
        request: &ChatRequest,
        sink: &dyn EventSink,
        live: &mut bool,
    ) -> Vec<CatalogEntry> {
        let mut entries = Vec::new();
        for id in &request.endpoints {
            match self.registry.catalog(id).await {
                Ok(catalog) => {
                    if let Some(endpoint) = self.registry.get(id).await {
                        entries.push((endpoint, catalog));
                    }
                }
                Err(e) => {
                    warn!("tool source '{id}' unavailable for this turn: {e}");
                    self.emit(
                        sink,
                        SessionEvent::Error {
                            message: format!("tool source '{id}' unavailable: {e}"),
                        },
                        live,
                    )
                    .await;
                }
            }
        }
        entries
    }

    /// The model call is the only thing retried automatically, and only
    /// for the overload class: bounded exponential backoff, then a
    /// terminal turn failure.
    async fn complete_with_retry(
        &self,
        model: &str,
        conversation: &[ChatMessage],
        tools: Option<&[CanonicalTool]>,
    ) -> Result<CompletionReply> {
        let mut attempt = 0;
        let mut delay = self.config.retry_initial_delay_ms;
        loop {
            match self.backend.complete(model, conversation, tools).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_overloaded() && attempt < self.config.completion_retries => {
                    attempt += 1;
                    warn!(
                        "model provider overloaded, retrying in {delay}ms (attempt {attempt}/{}): {e}",
                        self.config.completion_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    delay = (delay * 2).min(self.config.retry_max_delay_ms);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute one round of tool calls.
    ///
    /// Calls to different endpoints fan out concurrently; calls to the
    /// same endpoint run in sequence because some servers are sensitive to
    /// interleaved session use. The returned results are in issued order.
    async fn execute_round(
        &self,
        calls: &[ToolCallRequest],
        entries: &[CatalogEntry],
        sink: &dyn EventSink,
        live: &mut bool,
    ) -> Vec<Value> {
        struct Planned {
            index: usize,
            call: ToolCallRequest,
            endpoint: Arc<Endpoint>,
            raw_name: String,
        }

        let mut results: Vec<Option<Value>> = vec![None; calls.len()];
        let mut planned: Vec<Planned> = Vec::new();
        let mut labels: Vec<(String, String)> = Vec::new();

        for (index, call) in calls.iter().enumerate() {
            match resolve_call(&call.name, entries) {
                Some((endpoint, raw_name)) => {
                    labels.push((endpoint.id.clone(), raw_name.clone()));
                    planned.push(Planned {
                        index,
                        call: call.clone(),
                        endpoint,
                        raw_name,
                    });
                }
                None => {
                    // One unresolvable call must not abort the rest of the
                    // round; the model sees the error and can adapt.
                    warn!("no endpoint matches tool call '{}'", call.name);
                    labels.push(("unknown".to_string(), call.name.clone()));
                    results[index] = Some(json!({
                        "error": format!("no registered endpoint matches tool '{}'", call.name)
                    }));
                }
            }
        }

        for (call, (server, tool)) in calls.iter().zip(&labels) {
            self.emit(
                sink,
                SessionEvent::ToolCall {
                    server: server.clone(),
                    tool: tool.clone(),
                    arguments: call.arguments.clone(),
                },
                live,
            )
            .await;
        }

        let mut groups: HashMap<String, Vec<Planned>> = HashMap::new();
        for plan in planned {
            groups.entry(plan.endpoint.id.clone()).or_default().push(plan);
        }

        let group_futures = groups.into_values().map(|group| {
            let registry = Arc::clone(&self.registry);
            async move {
                let mut outputs = Vec::with_capacity(group.len());
                for plan in group {
                    let value = execute_call(
                        registry.as_ref(),
                        &plan.endpoint,
                        &plan.raw_name,
                        &plan.call.arguments,
                    )
                    .await;
                    outputs.push((plan.index, value));
                }
                outputs
            }
        });

        for outputs in futures::future::join_all(group_futures).await {
            for (index, value) in outputs {
                results[index] = Some(value);
            }
        }

        let results: Vec<Value> = results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| json!({"error": "tool call was not executed"})))
            .collect();

        for (result, (server, tool)) in results.iter().zip(&labels) {
            self.emit(
                sink,
                SessionEvent::ToolResult {
                    server: server.clone(),
                    tool: tool.clone(),
                    result: result.clone(),
                },
                live,
            )
            .await;
        }

        results
    }

    async fn emit(&self, sink: &dyn EventSink, event: SessionEvent, live: &mut bool) {
        if !*live {
            return;
        }
        if sink.emit(event).await.is_err() {
            warn!("event sink rejected write, treating live connection as closed");
            *live = false;
        }
    }
}

/// Route a model-issued qualified name back to `(endpoint, raw tool name)`.
///
/// The endpoint segment is matched by prefix against each endpoint's
/// sanitized id (with the hyphen/underscore fold as the single repair);
/// the raw name is recovered from the endpoint's catalog, since
/// sanitization is lossy.
fn resolve_call(
    qualified: &str,
    entries: &[CatalogEntry],
) -> Option<(Arc<Endpoint>, String)> {
    for (endpoint, catalog) in entries {
        if let Some(rest) = split_for_endpoint(qualified, endpoint) {
            let raw_name = catalog
                .iter()
                .find(|descriptor| {
                    let candidate = sanitize(&descriptor.name);
                    candidate == rest || candidate.replace('-', "_") == rest
                })
                .map(|descriptor| descriptor.name.clone())
                .unwrap_or(rest);
            return Some((Arc::clone(endpoint), raw_name));
        }
    }
    None
}

/// Execute one tool call against its endpoint. Never fails the round:
/// every outcome, error included, becomes a result value fed back to the
/// model. An auth/session-expired error additionally invalidates the
/// cached session so the next turn renegotiates (the call itself is not
/// retried).
async fn execute_call(
    registry: &SessionRegistry,
    endpoint: &Endpoint,
    tool: &str,
    arguments: &Value,
) -> Value {
    let session = match registry.get_or_negotiate(&endpoint.id).await {
        Ok(session) => session,
        Err(e) => return json!({"error": e.to_string()}),
    };

    let params = match serde_json::to_value(ToolCallParams {
        name: tool.to_string(),
        arguments: arguments.clone(),
    }) {
        Ok(params) => params,
        Err(e) => return json!({"error": format!("failed to encode arguments: {e}")}),
    };
    match registry
        .transport()
        .call(endpoint, Some(&session), "tools/call", params)
        .await
    {
        Ok(outcome) => render_tool_result(&outcome.result),
        Err(e) => {
            if e.invalidates_session() {
                registry.invalidate_session(&endpoint.id).await;
            }
            warn!("tool '{tool}' on endpoint '{}' failed: {e}", endpoint.id);
            json!({"error": e.to_string()})
        }
    }
}

/// Flatten an MCP tool result into the value fed back to the model.
/// `content` arrays of text items collapse to their text (JSON-parsed
/// when possible); anything else passes through untouched.
fn render_tool_result(result: &Value) -> Value {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result.clone();
    };

    let texts: Vec<&str> = content
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();

    match texts.as_slice() {
        [] => result.clone(),
        [single] => serde_json::from_str(single).unwrap_or_else(|_| json!(single)),
        many => json!(many.join("\n")),
    }
}
