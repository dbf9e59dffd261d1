//! HTTP transport adapter for JSON-RPC calls against MCP endpoints
//!
//! One JSON-RPC call per HTTP POST. The response body is either plain JSON
//! or an SSE-framed stream of `data: <json>` lines; both are normalized to
//! the same envelope. Transport failures, HTTP failures and JSON-RPC-level
//! errors are kept apart so callers can tell "server unreachable" from
//! "server reachable but refused the call".

use async_trait::async_trait;
use conductor_core::{ConductorError, Result};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::endpoint::{AuthCredential, Endpoint};
use crate::session::SessionContext;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Normalized result of one transport call: the JSON-RPC `result` payload
/// plus the response headers (lower-cased) so the session negotiator can
/// pick out session-identifying headers.
#[derive(Debug, Clone)]
pub struct RpcOutcome {
    pub result: Value,
    pub headers: HashMap<String, String>,
}

/// Transport seam for JSON-RPC calls. The production implementation is
/// [`HttpRpc`]; tests script this trait directly.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Perform one JSON-RPC call and return the normalized envelope.
    async fn call(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        method: &str,
        params: Value,
    ) -> Result<RpcOutcome>;

    /// Send a JSON-RPC notification. No response is expected; the body is
    /// discarded.
    async fn notify(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        method: &str,
        params: Value,
    ) -> Result<()>;
}

/// Reqwest-backed transport adapter.
pub struct HttpRpc {
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl HttpRpc {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConductorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn build_post(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        body: &impl serde::Serialize,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(Duration::from_millis(endpoint.timeout_ms))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(body);

        if let Some(AuthCredential::Bearer(token)) = &endpoint.auth {
            request = request.bearer_auth(token);
        }
        for (key, value) in &endpoint.extra_headers {
            request = request.header(key, value);
        }
        if let Some(session) = session {
            for (key, value) in &session.extra_headers {
                request = request.header(key, value);
            }
        }
        request
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response> {
        self.build_post(endpoint, session, body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, endpoint.timeout_ms))
    }
}

#[async_trait]
impl RpcTransport for HttpRpc {
    async fn call(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        method: &str,
        params: Value,
    ) -> Result<RpcOutcome> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, Some(params));
        debug!(
            endpoint = %endpoint.id,
            method,
            id = request.id,
            "sending JSON-RPC request"
        );

        let response = self.send(endpoint, session, &request).await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ConductorError::HttpStatus {
                status,
                body: excerpt(&body),
            });
        }

        let headers = collect_headers(&response);
        let content_type = headers.get("content-type").cloned().unwrap_or_default();

        let envelope: JsonRpcResponse = if content_type.starts_with("text/event-stream") {
            serde_json::from_value(first_json_frame(response, endpoint.timeout_ms).await?)?
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| map_reqwest_error(e, endpoint.timeout_ms))?;
            serde_json::from_str(&body)?
        };

        if let Some(error) = envelope.error {
            return Err(ConductorError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(RpcOutcome {
            result: envelope.result.unwrap_or(Value::Null),
            headers,
        })
    }

    async fn notify(
        &self,
        endpoint: &Endpoint,
        session: Option<&SessionContext>,
        method: &str,
        params: Value,
    ) -> Result<()> {
        let notification = JsonRpcNotification::new(method, Some(params));
        let response = self.send(endpoint, session, &notification).await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ConductorError::HttpStatus {
                status,
                body: excerpt(&body),
            });
        }
        Ok(())
    }
}

/// Consume an SSE-framed body incrementally and return the first `data:`
/// frame that parses as JSON. Frames that do not parse are skipped; a
/// stream that ends without any valid frame is a `MalformedStream`.
async fn first_json_frame(response: reqwest::Response, timeout_ms: u64) -> Result<Value> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_reqwest_error(e, timeout_ms))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            if let Some(value) = parse_sse_line(line.trim_end()) {
                return Ok(value);
            }
        }
    }

    // A final frame may arrive without a trailing newline.
    if let Some(value) = parse_sse_line(buffer.trim_end()) {
        return Ok(value);
    }

    Err(ConductorError::MalformedStream)
}

fn parse_sse_line(line: &str) -> Option<Value> {
    let data = line.strip_prefix("data:")?;
    serde_json::from_str(data.trim()).ok()
}

/// Pure variant of the frame scan over a complete body, shared with tests.
pub fn scan_sse_lines(body: &str) -> Option<Value> {
    body.lines().find_map(|line| parse_sse_line(line.trim_end()))
}

fn collect_headers(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn map_reqwest_error(error: reqwest::Error, timeout_ms: u64) -> ConductorError {
    if error.is_timeout() {
        ConductorError::Timeout(timeout_ms)
    } else {
        ConductorError::Unreachable(error.to_string())
    }
}

/// Bound error bodies so a misbehaving server cannot flood logs or events.
fn excerpt(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}
