use fleet_core::types::Target;
use tracing::debug;

use crate::jsonrpc::{
    tool_result_to_value, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION,
};
use crate::transport::{base_url, build_client, check_status, Transport, TransportError, TransportFactory};

// ---------------------------------------------------------------------------
// MCP transports
//
// Two flavors over HTTP. The event-stream flavor serves its stream on
// `/sse` and accepts JSON-RPC posts on `/messages`; the streamable flavor
// does both on `/mcp`. Command dispatch is request/response either way, so
// both flavors post `tools/call` and differ only in endpoint layout.
// ---------------------------------------------------------------------------

pub struct McpTransport {
    client: reqwest::Client,
    endpoint: String,
    target_name: String,
}

impl McpTransport {
    pub(crate) fn for_target(target: &Target, endpoint_path: &str) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(target)?,
            endpoint: format!("{}{}", base_url(target), endpoint_path),
            target_name: target.name.clone(),
        })
    }

    #[cfg(test)]
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn rpc(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let resp = self.client.post(&self.endpoint).json(request).send().await?;
        let resp = check_status(resp)?;
        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid JSON-RPC response: {e}")))?;
        Ok(parsed)
    }
}

#[async_trait::async_trait]
impl Transport for McpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        // Session handshake, then confirm the server actually serves tools.
        let init = JsonRpcRequest::new(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "fleetd", "version": env!("CARGO_PKG_VERSION")},
            })),
        );
        let resp = self.rpc(&init).await?;
        if let Some(err) = resp.error {
            return Err(TransportError::Protocol(format!(
                "initialize failed: {} ({})",
                err.message, err.code
            )));
        }
        let initialized = JsonRpcRequest::notification("notifications/initialized", None);
        self.client
            .post(&self.endpoint)
            .json(&initialized)
            .send()
            .await?;

        let request = JsonRpcRequest::new("tools/list", Some(serde_json::json!({})));
        let resp = self.rpc(&request).await?;
        if let Some(err) = resp.error {
            return Err(TransportError::Protocol(format!(
                "tools/list failed: {} ({})",
                err.message, err.code
            )));
        }
        debug!(target = %self.target_name, "mcp session established");
        Ok(())
    }

    async fn call(
        &self,
        command: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let request = JsonRpcRequest::tool_call(command, params);
        let resp = self.rpc(&request).await?;
        if let Some(err) = resp.error {
            return Err(TransportError::Protocol(format!(
                "{} ({})",
                err.message, err.code
            )));
        }
        let result = resp.result.unwrap_or(serde_json::Value::Null);
        Ok(tool_result_to_value(result))
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Event-stream MCP flavor: stream on `/sse`, requests on `/messages`.
pub struct McpSseFactory;

impl TransportFactory for McpSseFactory {
    fn name(&self) -> &'static str {
        "mcp-sse"
    }

    fn supports(&self, protocol: &str) -> bool {
        matches!(protocol, "mcp-sse" | "mcp")
    }

    fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(McpTransport::for_target(target, "/messages")?))
    }
}

/// Streamable MCP flavor: single `/mcp` endpoint.
pub struct McpHttpFactory;

impl TransportFactory for McpHttpFactory {
    fn name(&self) -> &'static str {
        "mcp-http"
    }

    fn supports(&self, protocol: &str) -> bool {
        protocol == "mcp-http"
    }

    fn create(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(McpTransport::for_target(target, "/mcp")?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_factory_claims_both_mcp_aliases() {
        let f = McpSseFactory;
        assert!(f.supports("mcp-sse"));
        assert!(f.supports("mcp"));
        assert!(!f.supports("mcp-http"));
        assert!(!f.supports("http"));
    }

    #[test]
    fn http_factory_claims_only_mcp_http() {
        let f = McpHttpFactory;
        assert!(f.supports("mcp-http"));
        assert!(!f.supports("mcp"));
        assert!(!f.supports("https"));
    }

    #[test]
    fn sse_flavor_posts_to_messages_endpoint() {
        let mut target = Target::new("web-01", "10.0.0.5", 8080);
        target.tls_verify = false;
        let t = McpTransport::for_target(&target, "/messages").unwrap();
        assert_eq!(t.endpoint(), "http://10.0.0.5:8080/messages");
    }

    #[test]
    fn streamable_flavor_uses_mcp_endpoint() {
        let target = Target::new("web-01", "10.0.0.5", 8443);
        let t = McpTransport::for_target(&target, "/mcp").unwrap();
        assert_eq!(t.endpoint(), "https://10.0.0.5:8443/mcp");
    }
}
