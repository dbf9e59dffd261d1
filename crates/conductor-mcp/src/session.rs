//! MCP session negotiation
//!
//! Performs the `initialize` → capability exchange → `notifications/initialized`
//! handshake against one endpoint and yields the session context every
//! subsequent call must reuse.

use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::transport::RpcTransport;
use crate::types::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, McpTool, PROTOCOL_VERSION,
};

/// Header names servers use to hand out a session identifier, checked in
/// order against the (lower-cased) response headers. Servers are not
/// consistent here.
pub const SESSION_HEADER_NAMES: &[&str] = &[
    "mcp-session-id",
    "x-session-id",
    "x-mcp-session-id",
    "session-id",
];

/// Negotiated per-endpoint state. Read-only after creation; discarded when
/// the endpoint reports an auth/session-expired error.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub endpoint_id: String,
    /// Version the server echoed back, not necessarily the one proposed.
    pub protocol_version: String,
    pub session_token: Option<String>,
    /// Headers to replay on every subsequent call to this endpoint.
    pub extra_headers: HashMap<String, String>,
    pub negotiated_at: DateTime<Utc>,
    /// Tools some servers front-load in the initialize result; discovery
    /// uses them directly and skips further RPCs.
    pub advertised_tools: Vec<McpTool>,
}

/// Negotiate a session with one endpoint.
///
/// An `initialize` failure (transport or RPC) marks the endpoint unusable
/// for the turn. Failure to deliver `notifications/initialized` is logged
/// and tolerated; some servers never expect it.
pub async fn negotiate(transport: &dyn RpcTransport, endpoint: &Endpoint) -> Result<SessionContext> {
    info!("Negotiating MCP session with endpoint '{}'", endpoint.id);

    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: ClientInfo::default(),
    };

    let outcome = transport
        .call(endpoint, None, "initialize", serde_json::to_value(params)?)
        .await
        .map_err(|e| ConductorError::Negotiation {
            endpoint: endpoint.id.clone(),
            reason: e.to_string(),
        })?;

    // Partial servers return sparse or odd-shaped initialize results;
    // anything unparseable degrades to defaults rather than failing the
    // handshake the server just accepted.
    let init: InitializeResult = serde_json::from_value(outcome.result).unwrap_or_default();

    let protocol_version = match init.protocol_version {
        Some(version) => version,
        None => {
            warn!(
                "endpoint '{}' echoed no protocol version, assuming {}",
                endpoint.id, PROTOCOL_VERSION
            );
            PROTOCOL_VERSION.to_string()
        }
    };

    if let Some(server_info) = &init.server_info {
        info!(
            "Connected to MCP server: {} v{}",
            server_info.name, server_info.version
        );
    }

    let mut session_token = None;
    let mut extra_headers = HashMap::new();
    for name in SESSION_HEADER_NAMES {
        if let Some(value) = outcome.headers.get(*name) {
            session_token = Some(value.clone());
            // Replay under the same header name the server used.
            extra_headers.insert((*name).to_string(), value.clone());
            break;
        }
    }

    let context = SessionContext {
        endpoint_id: endpoint.id.clone(),
        protocol_version,
        session_token,
        extra_headers,
        negotiated_at: Utc::now(),
        advertised_tools: init.tools.unwrap_or_default(),
    };

    if let Err(e) = transport
        .notify(endpoint, Some(&context), "notifications/initialized", json!({}))
        .await
    {
        warn!(
            "endpoint '{}' did not accept notifications/initialized: {}",
            endpoint.id, e
        );
    }

    info!(
        "Session negotiated with '{}' (protocol {})",
        endpoint.id, context.protocol_version
    );

    Ok(context)
}
