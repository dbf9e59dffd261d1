//! End-to-end turn flow against scripted collaborators: a scripted
//! completion backend, a scripted transport behind the session registry,
//! and a collecting event sink.

use async_trait::async_trait;
use conductor_core::{
    CanonicalTool, ChatMessage, ChatRequest, CompletionBackend, CompletionReply, ConductorError,
    EventSink, Result, Role, SessionEvent, ToolCallRequest,
};
use conductor_engine::{Engine, EngineConfig};
use conductor_mcp::{Endpoint, RpcOutcome, RpcTransport, SessionContext, SessionRegistry};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Step {
    Text(&'static str),
    Calls(Vec<ToolCallRequest>),
    Overloaded,
}

struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    attempts: AtomicUsize,
    seen_tool_names: Mutex<Vec<Vec<String>>>,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            attempts: AtomicUsize::new(0),
            seen_tool_names: Mutex::new(Vec::new()),
        }
    }

    fn repeating(step: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            repeat: Some(step),
            attempts: AtomicUsize::new(0),
            seen_tool_names: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(
        &self,
        _model: &str,
        _conversation: &[ChatMessage],
        tools: Option<&[CanonicalTool]>,
    ) -> Result<CompletionReply> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.seen_tool_names.lock().unwrap().push(
            tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.name.clone())
                .collect(),
        );

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| ConductorError::Completion("script exhausted".to_string()))?;

        match step {
            Step::Text(text) => Ok(CompletionReply {
                content: Some(text.to_string()),
                tool_calls: Vec::new(),
            }),
            Step::Calls(calls) => Ok(CompletionReply {
                content: None,
                tool_calls: calls,
            }),
            Step::Overloaded => Err(ConductorError::Overloaded("529".to_string())),
        }
    }
}

/// Scripted transport: fixed tool lists per endpoint, per-endpoint call
/// delays, optional initialize/call failures, concurrency accounting.
#[derive(Default)]
struct TestTransport {
    tools: HashMap<String, Vec<&'static str>>,
    call_delay_ms: HashMap<String, u64>,
    fail_init: HashSet<String>,
    fail_call_status: HashMap<String, u16>,
    initializes: AtomicUsize,
    executed: Mutex<Vec<(String, String)>>,
    in_flight: Mutex<HashMap<String, usize>>,
    per_endpoint_max: Mutex<HashMap<String, usize>>,
    global_max: AtomicUsize,
}

impl TestTransport {
    fn with_endpoint(mut self, id: &str, tools: Vec<&'static str>) -> Self {
        self.tools.insert(id.to_string(), tools);
        self
    }

    fn with_delay(mut self, id: &str, delay_ms: u64) -> Self {
        self.call_delay_ms.insert(id.to_string(), delay_ms);
        self
    }

    fn with_failing_init(mut self, id: &str) -> Self {
        self.fail_init.insert(id.to_string());
        self
    }

    fn with_call_status(mut self, id: &str, status: u16) -> Self {
        self.fail_call_status.insert(id.to_string(), status);
        self
    }

    fn enter(&self, id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let counter = in_flight.entry(id.to_string()).or_insert(0);
        *counter += 1;
        let current = *counter;
        let total: usize = in_flight.values().sum();
        drop(in_flight);

        let mut per_max = self.per_endpoint_max.lock().unwrap();
        let max = per_max.entry(id.to_string()).or_insert(0);
        if current > *max {
            *max = current;
        }
        self.global_max.fetch_max(total, Ordering::SeqCst);
    }

    fn leave(&self, id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(counter) = in_flight.get_mut(id) {
            *counter -= 1;
        }
    }
}

#[async_trait]
impl RpcTransport for TestTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        _session: Option<&SessionContext>,
        method: &str,
        params: Value,
    ) -> Result<RpcOutcome> {
        match method {
            "initialize" => {
                if self.fail_init.contains(&endpoint.id) {
                    return Err(ConductorError::Unreachable("connection refused".to_string()));
                }
                self.initializes.fetch_add(1, Ordering::SeqCst);
                Ok(RpcOutcome {
                    result: json!({"protocolVersion": "2024-11-05"}),
                    headers: HashMap::new(),
                })
            }
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .get(&endpoint.id)
                    .map(|names| names.iter().map(|n| json!({"name": n})).collect())
                    .unwrap_or_default();
                Ok(RpcOutcome {
                    result: json!({"tools": tools}),
                    headers: HashMap::new(),
                })
            }
            "tools/call" => {
                if let Some(status) = self.fail_call_status.get(&endpoint.id) {
                    return Err(ConductorError::HttpStatus {
                        status: *status,
                        body: "denied".to_string(),
                    });
                }
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                self.executed
                    .lock()
                    .unwrap()
                    .push((endpoint.id.clone(), name.clone()));

                self.enter(&endpoint.id);
                let delay = self.call_delay_ms.get(&endpoint.id).copied().unwrap_or(0);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                self.leave(&endpoint.id);

                Ok(RpcOutcome {
                    result: json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{{\"tool\":\"{name}\",\"endpoint\":\"{}\"}}", endpoint.id)
                        }]
                    }),
                    headers: HashMap::new(),
                })
            }
            _ => Err(ConductorError::Rpc {
                code: conductor_core::METHOD_NOT_FOUND,
                message: "method not found".to_string(),
            }),
        }
    }

    async fn notify(
        &self,
        _endpoint: &Endpoint,
        _session: Option<&SessionContext>,
        _method: &str,
        _params: Value,
    ) -> Result<()> {
        Ok(())
    }
}

struct CollectingSink {
    events: Mutex<Vec<SessionEvent>>,
    closed: bool,
}

impl CollectingSink {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            closed: false,
        }
    }

    fn closed() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            closed: true,
        }
    }

    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: SessionEvent) -> Result<()> {
        if self.closed {
            return Err(ConductorError::ConnectionClosed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_initial_delay_ms: 5,
        retry_max_delay_ms: 20,
        ..EngineConfig::default()
    }
}

async fn registry_with(transport: Arc<TestTransport>, ids: &[&str]) -> Arc<SessionRegistry> {
    let registry = Arc::new(SessionRegistry::new(transport));
    for id in ids {
        registry
            .register(Endpoint::new(*id, format!("https://{id}.example.com/mcp")))
            .await;
    }
    registry
}

fn request(message: &str, endpoints: &[&str]) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
        model: "test-model".to_string(),
    }
}

fn call(id: &str, name: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: json!({}),
    }
}

fn tool_messages(conversation: &[ChatMessage]) -> Vec<&ChatMessage> {
    conversation
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect()
}

#[tokio::test]
async fn test_plain_text_turn() {
    let transport = Arc::new(TestTransport::default());
    let registry = registry_with(transport, &[]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Text("hello there")]));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("hi", &[]), Vec::new(), &sink)
        .await
        .unwrap();

    assert_eq!(backend.attempts(), 1);
    let last = conversation.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "hello there");

    let events = sink.events();
    assert!(matches!(events.first(), Some(SessionEvent::Status { .. })));
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Message { content, .. }) if content == "hello there"
    ));
}

#[tokio::test]
async fn test_tool_results_keep_issued_order() {
    // alpha answers slowly, beta instantly; the model issued alpha first,
    // so alpha's result must still come first.
    let transport = Arc::new(
        TestTransport::default()
            .with_endpoint("alpha", vec!["slow_tool"])
            .with_endpoint("beta", vec!["fast_tool"])
            .with_delay("alpha", 80),
    );
    let registry = registry_with(transport.clone(), &["alpha", "beta"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Calls(vec![
            call("call_a", "alpha__slow_tool"),
            call("call_b", "beta__fast_tool"),
        ]),
        Step::Text("done"),
    ]));
    let engine = Engine::new(registry, backend, fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("go", &["alpha", "beta"]), Vec::new(), &sink)
        .await
        .unwrap();

    let tools = tool_messages(&conversation);
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tools[1].tool_call_id.as_deref(), Some("call_b"));

    // Calls to distinct endpoints overlapped.
    assert!(transport.global_max.load(Ordering::SeqCst) >= 2);

    // Result events are emitted in issued order too.
    let result_tools: Vec<String> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ToolResult { tool, .. } => Some(tool.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(result_tools, vec!["slow_tool", "fast_tool"]);
}

#[tokio::test]
async fn test_same_endpoint_calls_are_serialized() {
    let transport = Arc::new(
        TestTransport::default()
            .with_endpoint("alpha", vec!["tool_one", "tool_two"])
            .with_delay("alpha", 30),
    );
    let registry = registry_with(transport.clone(), &["alpha"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Calls(vec![
            call("c1", "alpha__tool_one"),
            call("c2", "alpha__tool_two"),
        ]),
        Step::Text("ok"),
    ]));
    let engine = Engine::new(registry, backend, fast_config());
    let sink = CollectingSink::new();

    engine
        .run_turn(&request("go", &["alpha"]), Vec::new(), &sink)
        .await
        .unwrap();

    let per_max = transport.per_endpoint_max.lock().unwrap().clone();
    assert_eq!(per_max.get("alpha"), Some(&1));
}

#[tokio::test]
async fn test_round_cap_terminates_turn() {
    let transport = Arc::new(TestTransport::default().with_endpoint("alpha", vec!["loop_tool"]));
    let registry = registry_with(transport, &["alpha"]).await;
    let backend = Arc::new(ScriptedBackend::repeating(Step::Calls(vec![call(
        "c",
        "alpha__loop_tool",
    )])));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("loop forever", &["alpha"]), Vec::new(), &sink)
        .await
        .unwrap();

    // Exactly the default cap of model rounds, then a terminal notice.
    assert_eq!(backend.attempts(), 5);
    let last = conversation.last().unwrap();
    assert!(last.content.contains("Stopped after 5 rounds"));
    assert!(matches!(
        sink.events().last(),
        Some(SessionEvent::Message { content, .. }) if content.contains("Stopped after 5 rounds")
    ));
}

#[tokio::test]
async fn test_overload_retried_then_succeeds() {
    let transport = Arc::new(TestTransport::default().with_endpoint("alpha", vec!["t"]));
    let registry = registry_with(transport, &["alpha"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Overloaded,
        Step::Overloaded,
        Step::Text("recovered"),
    ]));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("hi", &["alpha"]), Vec::new(), &sink)
        .await
        .unwrap();

    // Two backoff-delayed retries, then a normal turn.
    assert_eq!(backend.attempts(), 3);
    assert_eq!(conversation.last().unwrap().content, "recovered");

    // No tool state lost across retries: every attempt saw the same set.
    let seen = backend.seen_tool_names.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|names| names == &seen[0]));
}

#[tokio::test]
async fn test_overload_exhausts_retries() {
    let transport = Arc::new(TestTransport::default());
    let registry = registry_with(transport, &[]).await;
    let backend = Arc::new(ScriptedBackend::repeating(Step::Overloaded));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::new();

    let error = engine
        .run_turn(&request("hi", &[]), Vec::new(), &sink)
        .await
        .unwrap_err();

    assert!(error.is_overloaded());
    // First attempt plus the two configured retries.
    assert_eq!(backend.attempts(), 3);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error { .. })));
}

#[tokio::test]
async fn test_degraded_endpoint_does_not_abort_turn() {
    let transport = Arc::new(
        TestTransport::default()
            .with_endpoint("good", vec!["good_tool"])
            .with_failing_init("bad"),
    );
    let registry = registry_with(transport, &["good", "bad"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Text("still here")]));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::new();

    engine
        .run_turn(&request("hi", &["good", "bad"]), Vec::new(), &sink)
        .await
        .unwrap();

    // The failing endpoint is named in an error event...
    assert!(sink.events().iter().any(|e| matches!(
        e,
        SessionEvent::Error { message } if message.contains("bad")
    )));
    // ...and the model still received the healthy endpoint's tools.
    let seen = backend.seen_tool_names.lock().unwrap().clone();
    assert_eq!(seen[0], vec!["good__good_tool".to_string()]);
}

#[tokio::test]
async fn test_unresolvable_call_is_contained() {
    let transport = Arc::new(TestTransport::default().with_endpoint("alpha", vec!["real_tool"]));
    let registry = registry_with(transport.clone(), &["alpha"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Calls(vec![
            call("c1", "ghost__missing"),
            call("c2", "alpha__real_tool"),
        ]),
        Step::Text("done"),
    ]));
    let engine = Engine::new(registry, backend, fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("go", &["alpha"]), Vec::new(), &sink)
        .await
        .unwrap();

    let tools = tool_messages(&conversation);
    assert_eq!(tools.len(), 2);
    assert!(tools[0].content.contains("error"));
    // The unresolvable call did not block its sibling.
    let executed = transport.executed.lock().unwrap().clone();
    assert_eq!(
        executed,
        vec![("alpha".to_string(), "real_tool".to_string())]
    );
}

#[tokio::test]
async fn test_auth_error_invalidates_session() {
    let transport = Arc::new(
        TestTransport::default()
            .with_endpoint("alpha", vec!["secure_tool"])
            .with_call_status("alpha", 401),
    );
    let registry = registry_with(transport.clone(), &["alpha"]).await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Calls(vec![call("c1", "alpha__secure_tool")]),
        Step::Text("first turn done"),
        Step::Calls(vec![call("c2", "alpha__secure_tool")]),
        Step::Text("second turn done"),
    ]));
    let engine = Engine::new(registry, backend, fast_config());
    let sink = CollectingSink::new();

    let conversation = engine
        .run_turn(&request("one", &["alpha"]), Vec::new(), &sink)
        .await
        .unwrap();

    // The failed call is reported to the model, not retried.
    let tools = tool_messages(&conversation);
    assert!(tools[0].content.contains("401"));
    assert_eq!(transport.initializes.load(Ordering::SeqCst), 1);

    // The next turn renegotiates from scratch.
    engine
        .run_turn(&request("two", &["alpha"]), conversation, &sink)
        .await
        .unwrap();
    assert_eq!(transport.initializes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_closed_connection_prevents_new_rounds() {
    let transport = Arc::new(TestTransport::default());
    let registry = registry_with(transport, &[]).await;
    let backend = Arc::new(ScriptedBackend::repeating(Step::Text("unseen")));
    let engine = Engine::new(registry, backend.clone(), fast_config());
    let sink = CollectingSink::closed();

    let conversation = engine
        .run_turn(&request("hi", &[]), Vec::new(), &sink)
        .await
        .unwrap();

    // The connection died before the first model call; no round started.
    assert_eq!(backend.attempts(), 0);
    assert_eq!(conversation.last().unwrap().role, Role::User);
}
