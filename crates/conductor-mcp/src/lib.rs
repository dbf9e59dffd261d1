//! MCP integration for Conductor
//!
//! Session negotiation, tolerant tool discovery, canonical tool naming and
//! the shared HTTP transport for JSON-RPC calls against remote MCP
//! endpoints.

pub mod catalog;
pub mod config;
pub mod endpoint;
pub mod naming;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use catalog::{discover, static_catalog, ToolDescriptor, LIST_METHODS};
pub use config::{parse_quick_add, resolve_env_value, EndpointConfig, EndpointsConfig};
pub use endpoint::{AuthCredential, Endpoint, QuirkProfile};
pub use naming::{
    canonicalize, decompose, flatten_tools, matches_endpoint, qualify, repair_schema, sanitize,
    split_for_endpoint, MAX_NAME_LEN, SEPARATOR,
};
pub use registry::SessionRegistry;
pub use session::{negotiate, SessionContext, SESSION_HEADER_NAMES};
pub use transport::{HttpRpc, RpcOutcome, RpcTransport};
pub use types::{McpTool, ToolCallParams, PROTOCOL_VERSION};
