//! Tool discovery for one endpoint
//!
//! Attempts, in order: tools front-loaded in the negotiation response, the
//! canonical listing method, the fallback method names, and finally a
//! statically bundled catalog for recognized services. An endpoint that
//! yields nothing gets an empty catalog and a diagnostic, never an error.

use conductor_core::Result;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::session::SessionContext;
use crate::transport::RpcTransport;
use crate::types::McpTool;

/// Listing method names, consulted in priority order. The first entry is
/// the canonical MCP method; the rest cover servers that predate it or
/// renamed it. This list is the single source of truth for fallback
/// discovery.
pub const LIST_METHODS: &[&str] = &["tools/list", "tools.list", "listTools", "list_tools"];

/// One discovered tool, tagged with its originating endpoint. Catalogs are
/// replaced wholesale on refresh, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub origin: String,
    pub name: String,
    pub description: String,
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    pub fn from_mcp(origin: &str, tool: McpTool) -> Self {
        Self {
            origin: origin.to_string(),
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }
}

/// Discover the tool catalog for one endpoint.
pub async fn discover(
    transport: &dyn RpcTransport,
    endpoint: &Endpoint,
    session: &SessionContext,
) -> Vec<ToolDescriptor> {
    if !session.advertised_tools.is_empty() {
        debug!(
            "endpoint '{}' front-loaded {} tools during negotiation",
            endpoint.id,
            session.advertised_tools.len()
        );
        return session
            .advertised_tools
            .iter()
            .cloned()
            .map(|tool| ToolDescriptor::from_mcp(&endpoint.id, tool))
            .collect();
    }

    let methods: &[&str] = if endpoint.quirks.supports_canonical_listing {
        LIST_METHODS
    } else {
        &LIST_METHODS[1..]
    };

    for method in methods {
        match transport.call(endpoint, Some(session), method, json!({})).await {
            Ok(outcome) => {
                if let Some(tools) = extract_tools(&outcome.result) {
                    info!(
                        "Discovered {} tools from endpoint '{}' via {}",
                        tools.len(),
                        endpoint.id,
                        method
                    );
                    return tools
                        .into_iter()
                        .map(|tool| ToolDescriptor::from_mcp(&endpoint.id, tool))
                        .collect();
                }
                debug!(
                    "endpoint '{}' answered {} without a tools array",
                    endpoint.id, method
                );
            }
            Err(e) if e.is_method_not_found() => {
                debug!(
                    "endpoint '{}' does not implement {}, trying next",
                    endpoint.id, method
                );
            }
            Err(e) => {
                warn!(
                    "tool listing via {} failed on endpoint '{}': {}",
                    method, endpoint.id, e
                );
                break;
            }
        }
    }

    if let Some(service) = &endpoint.quirks.static_fallback {
        if let Some(tools) = static_catalog(service) {
            warn!(
                "endpoint '{}' has no working listing method, using bundled '{}' catalog",
                endpoint.id, service
            );
            return tools
                .into_iter()
                .map(|tool| ToolDescriptor::from_mcp(&endpoint.id, tool))
                .collect();
        }
    }

    warn!(
        "endpoint '{}' yielded no tools, continuing with an empty catalog",
        endpoint.id
    );
    Vec::new()
}

/// Pull a tools array out of a listing result. Servers answer with either
/// `{"tools": [...]}` or a bare array.
fn extract_tools(result: &Value) -> Option<Vec<McpTool>> {
    let raw = if result.is_array() {
        result.clone()
    } else {
        result.get("tools")?.clone()
    };
    serde_json::from_value(raw).ok()
}

/// Gmail connector actions, bundled for servers whose listing call is
/// absent but whose execution call works. Operator-maintained, last-resort
/// table; unknown service keys yield no catalog.
const GMAIL_ACTIONS: &[&str] = &[
    "GMAIL_SEND_EMAIL",
    "GMAIL_GET_PROFILE",
    "GMAIL_LIST_EMAILS",
    "GMAIL_GET_EMAIL",
    "GMAIL_CREATE_DRAFT",
    "GMAIL_REPLY_TO_EMAIL",
    "GMAIL_FORWARD_EMAIL",
    "GMAIL_DELETE_EMAIL",
    "GMAIL_MARK_EMAIL_AS_READ",
    "GMAIL_MARK_EMAIL_AS_UNREAD",
    "GMAIL_ADD_LABEL_TO_EMAIL",
    "GMAIL_REMOVE_LABEL_FROM_EMAIL",
    "GMAIL_LIST_LABELS",
    "GMAIL_CREATE_LABEL",
];

/// Statically bundled tool set for a recognized service.
pub fn static_catalog(service: &str) -> Option<Vec<McpTool>> {
    match service {
        "gmail" => Some(
            GMAIL_ACTIONS
                .iter()
                .map(|action| McpTool {
                    name: (*action).to_string(),
                    description: format!(
                        "Gmail action: {}",
                        title_case(action.trim_start_matches("GMAIL_"))
                    ),
                    input_schema: Some(json!({
                        "type": "object",
                        "properties": {},
                        "required": []
                    })),
                })
                .collect(),
        ),
        _ => None,
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::QuirkProfile;
    use crate::transport::RpcOutcome;
    use async_trait::async_trait;
    use chrono::Utc;
    use conductor_core::ConductorError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Transport scripted per method name.
    struct ScriptedTransport {
        responses: HashMap<String, Result<Value>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn answer(mut self, method: &str, result: Value) -> Self {
            self.responses.insert(method.to_string(), Ok(result));
            self
        }

        fn refuse(mut self, method: &str, code: i64) -> Self {
            self.responses.insert(
                method.to_string(),
                Err(ConductorError::Rpc {
                    code,
                    message: "refused".to_string(),
                }),
            );
            self
        }

        fn call_log(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn call(
            &self,
            _endpoint: &Endpoint,
            _session: Option<&SessionContext>,
            method: &str,
            _params: Value,
        ) -> Result<RpcOutcome> {
            self.calls.lock().unwrap().push(method.to_string());
            match self.responses.get(method) {
                Some(Ok(result)) => Ok(RpcOutcome {
                    result: result.clone(),
                    headers: HashMap::new(),
                }),
                Some(Err(ConductorError::Rpc { code, message })) => Err(ConductorError::Rpc {
                    code: *code,
                    message: message.clone(),
                }),
                Some(Err(_)) | None => Err(ConductorError::Unreachable("no script".to_string())),
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

    fn session_for(endpoint: &Endpoint) -> SessionContext {
        SessionContext {
            endpoint_id: endpoint.id.clone(),
            protocol_version: "2024-11-05".to_string(),
            session_token: None,
            extra_headers: HashMap::new(),
            negotiated_at: Utc::now(),
            advertised_tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_canonical_listing() {
        let endpoint = Endpoint::new("svc", "https://svc.example.com/mcp");
        let transport = ScriptedTransport::new()
            .answer("tools/list", json!({"tools": [{"name": "search"}]}));

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "search");
        assert_eq!(catalog[0].origin, "svc");
        assert_eq!(transport.call_log(), vec!["tools/list"]);
    }

    #[tokio::test]
    async fn test_fallback_on_method_not_found_stops_at_first_success() {
        let endpoint = Endpoint::new("e", "https://e.example.com/mcp");
        let transport = ScriptedTransport::new()
            .refuse("tools/list", conductor_core::METHOD_NOT_FOUND)
            .answer("tools.list", json!({"tools": [{"name": "PING"}]}));

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "PING");
        // Zero RPCs after the successful fallback.
        assert_eq!(transport.call_log(), vec!["tools/list", "tools.list"]);
    }

    #[tokio::test]
    async fn test_front_loaded_tools_skip_rpcs() {
        let endpoint = Endpoint::new("svc", "https://svc.example.com/mcp");
        let mut session = session_for(&endpoint);
        session.advertised_tools = vec![McpTool {
            name: "embedded".to_string(),
            description: String::new(),
            input_schema: None,
        }];

        let transport = ScriptedTransport::new();
        let catalog = discover(&transport, &endpoint, &session).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "embedded");
        assert!(transport.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_static_fallback_for_recognized_service() {
        let endpoint = Endpoint::new(
            "gmail",
            "https://mcp.composio.dev/gmail/mcp?customerId=test",
        );
        // Every listing attempt rejected outright.
        let transport = ScriptedTransport::new();

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert!(!catalog.is_empty());
        assert!(catalog.iter().any(|t| t.name == "GMAIL_SEND_EMAIL"));
        assert!(catalog.iter().all(|t| t.origin == "gmail"));
    }

    #[tokio::test]
    async fn test_no_tools_anywhere_yields_empty_catalog() {
        let endpoint = Endpoint::new("bare", "https://bare.example.com/mcp");
        let transport = ScriptedTransport::new();

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_quirk_skips_canonical_method() {
        let endpoint = Endpoint::new("old", "https://old.example.com/mcp").with_quirks(
            QuirkProfile {
                supports_canonical_listing: false,
                ..QuirkProfile::default()
            },
        );
        let transport = ScriptedTransport::new()
            .answer("tools.list", json!({"tools": [{"name": "t"}]}));

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(transport.call_log(), vec!["tools.list"]);
    }

    #[tokio::test]
    async fn test_bare_array_listing_shape() {
        let endpoint = Endpoint::new("svc", "https://svc.example.com/mcp");
        let transport = ScriptedTransport::new().answer("tools/list", json!([{"name": "a"}]));

        let catalog = discover(&transport, &endpoint, &session_for(&endpoint)).await;
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_static_catalog_unknown_service() {
        assert!(static_catalog("jira").is_none());
    }

    #[test]
    fn test_static_catalog_descriptions() {
        let tools = static_catalog("gmail").unwrap();
        let send = tools.iter().find(|t| t.name == "GMAIL_SEND_EMAIL").unwrap();
        assert_eq!(send.description, "Gmail action: Send Email");
        // Degraded-mode schemas are well-formed object schemas.
        let schema = send.input_schema.as_ref().unwrap();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].is_object());
    }
}
