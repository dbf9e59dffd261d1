//! Endpoint records and per-endpoint quirk profiles
//!
//! A quirk profile captures what is known about a server's conformance at
//! registration time, so nothing downstream has to re-sniff URLs on every
//! call.

use std::collections::HashMap;

/// Credential attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCredential {
    /// Sent as `Authorization: Bearer <token>` on every call.
    Bearer(String),
    /// The credential rides inside the endpoint URL itself (e.g. a
    /// connector `customerId=` query parameter); nothing extra is sent.
    QueryEmbedded,
}

/// Conformance flags for one endpoint, resolved once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuirkProfile {
    /// Server may answer with an SSE-framed body instead of plain JSON.
    pub sse_capable: bool,
    /// Server understands the canonical tools-listing method; when false,
    /// discovery starts directly at the fallback method names.
    pub supports_canonical_listing: bool,
    /// Connector endpoints are retained preferentially when the flattened
    /// tool set exceeds the per-turn budget.
    pub connector: bool,
    /// Service key of a bundled degraded-mode catalog, for servers whose
    /// listing call is absent but whose execution call works.
    pub static_fallback: Option<String>,
}

impl Default for QuirkProfile {
    fn default() -> Self {
        Self {
            sse_capable: true,
            supports_canonical_listing: true,
            connector: false,
            static_fallback: None,
        }
    }
}

impl QuirkProfile {
    /// Resolve a profile from the endpoint URL. Connector-hosted servers
    /// are recognized here once instead of being sniffed per call.
    pub fn resolve(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("composio") {
            let static_fallback = if lower.contains("gmail") {
                Some("gmail".to_string())
            } else {
                None
            };
            Self {
                sse_capable: true,
                supports_canonical_listing: true,
                connector: true,
                static_fallback,
            }
        } else {
            Self::default()
        }
    }
}

/// One addressable remote MCP server. Immutable once registered; removal
/// is the only mutation.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub auth: Option<AuthCredential>,
    pub quirks: QuirkProfile,
    pub timeout_ms: u64,
    pub extra_headers: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let quirks = QuirkProfile::resolve(&url);
        Self {
            id: id.into(),
            url,
            auth: None,
            quirks,
            timeout_ms: 30_000,
            extra_headers: HashMap::new(),
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(AuthCredential::Bearer(token.into()));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_quirks(mut self, quirks: QuirkProfile) -> Self {
        self.quirks = quirks;
        self
    }
}
