//! Endpoint configuration
//!
//! YAML endpoint declarations with environment-variable substitution,
//! multi-file merging, and quick-add parsing of raw endpoint URLs.

use conductor_core::{ConductorError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use tracing::{info, warn};

use crate::endpoint::{AuthCredential, Endpoint, QuirkProfile};

/// Endpoints configuration container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Map of endpoint id to configuration
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

/// Declaration of one remote MCP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,

    /// Bearer token sent on every call. Supports `${VAR}` substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Extra headers to include in requests
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Timeout in milliseconds (default: 30000)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Connector endpoints keep their tools preferentially under the
    /// per-turn tool budget
    #[serde(default)]
    pub connector: bool,

    /// Whether this endpoint is disabled
    #[serde(default)]
    pub disabled: bool,
}

fn default_timeout() -> u64 {
    30_000
}

impl EndpointConfig {
    /// Materialize an immutable endpoint record, resolving env-var
    /// references and the quirk profile once, at registration time.
    pub fn into_endpoint(self, id: &str) -> Endpoint {
        let url = resolve_env_value(&self.url);
        let mut quirks = QuirkProfile::resolve(&url);
        if self.connector {
            quirks.connector = true;
        }

        let auth = match self.auth_token {
            Some(token) => Some(AuthCredential::Bearer(resolve_env_value(&token))),
            None if url.contains("customerId=") => Some(AuthCredential::QueryEmbedded),
            None => None,
        };

        let extra_headers = self
            .headers
            .into_iter()
            .map(|(k, v)| (k, resolve_env_value(&v)))
            .collect();

        Endpoint {
            id: id.to_string(),
            url,
            auth,
            quirks,
            timeout_ms: self.timeout,
            extra_headers,
        }
    }
}

impl EndpointsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConductorError::Config(format!("failed to parse endpoints YAML: {e}")))
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading endpoint configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::Config(format!(
                "failed to read endpoints file {}: {e}",
                path.display()
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load all YAML files from a directory; missing directory is empty.
    pub async fn load_from_directory<P: AsRef<Path>>(dir: P) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        let mut configs = Vec::new();

        if !dir.exists() {
            return Ok(configs);
        }

        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
            ConductorError::Config(format!("failed to read directory {}: {e}", dir.display()))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            match Self::load_from_file(&path).await {
                Ok(config) => configs.push(config),
                Err(e) => {
                    warn!("skipping endpoints file {}: {}", path.display(), e);
                }
            }
        }

        Ok(configs)
    }

    /// Merge another configuration into this one; the other side wins.
    pub fn merge(&mut self, other: EndpointsConfig) {
        for (id, config) in other.endpoints {
            self.endpoints.insert(id, config);
        }
    }

    /// Endpoints not marked disabled.
    pub fn enabled_endpoints(&self) -> impl Iterator<Item = (&String, &EndpointConfig)> {
        self.endpoints.iter().filter(|(_, c)| !c.disabled)
    }
}

// Supports ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("invalid env var regex")
});

/// Substitute environment-variable references in a config string. Unknown
/// variables without a default are left as-is so the failure surfaces at
/// call time with context, not at load time.
pub fn resolve_env_value(value: &str) -> String {
    let mut result = value.to_string();
    for cap in ENV_VAR_REGEX.captures_iter(value) {
        let full_match = &cap[0];
        let var_name = &cap[1];
        let default_value = cap.get(2).map(|m| m.as_str());

        match env::var(var_name) {
            Ok(resolved) => result = result.replace(full_match, &resolved),
            Err(_) => {
                if let Some(default) = default_value {
                    result = result.replace(full_match, default);
                }
            }
        }
    }
    result
}

/// Parse a raw operator input (an MCP endpoint URL) into a named endpoint
/// entry.
///
/// The id comes from the last meaningful URL path segment. A `token=`
/// query credential becomes a bearer token and is stripped from the stored
/// URL; connector URLs carrying an embedded customer credential are kept
/// intact, query string and all.
pub fn parse_quick_add(input: &str) -> Result<(String, EndpointConfig)> {
    let input = input.trim();
    if !input.starts_with("http://") && !input.starts_with("https://") {
        return Err(ConductorError::Config(format!(
            "cannot determine how to add endpoint from: {input}"
        )));
    }

    let without_query = input.split('?').next().unwrap_or(input);
    let name = derive_endpoint_name(without_query);

    let is_connector = input.to_ascii_lowercase().contains("composio")
        || input.contains("customerId=");

    let (url, auth_token) = if is_connector {
        // The embedded credential is part of the address; keep it.
        (input.to_string(), None)
    } else if let Some(token) = query_param(input, "token") {
        (without_query.to_string(), Some(token))
    } else {
        (without_query.to_string(), None)
    };

    Ok((
        name,
        EndpointConfig {
            url,
            auth_token,
            headers: HashMap::new(),
            timeout: default_timeout(),
            connector: is_connector,
            disabled: false,
        },
    ))
}

fn derive_endpoint_name(url_without_query: &str) -> String {
    let after_scheme = url_without_query
        .splitn(2, "://")
        .nth(1)
        .unwrap_or(url_without_query);
    let mut parts = after_scheme.split('/');
    let host = parts.next().unwrap_or("remote-server");
    let segments: Vec<&str> = parts.filter(|s| !s.is_empty()).collect();

    match segments.last() {
        // A trailing /mcp segment is protocol plumbing, not a name.
        Some(&"mcp") if segments.len() >= 2 => segments[segments.len() - 2].to_string(),
        Some(&"mcp") | None => host.to_string(),
        Some(segment) => (*segment).to_string(),
    }
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split('?').nth(1)?;
    let prefix = format!("{name}=");
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))
        .map(str::to_string)
}
