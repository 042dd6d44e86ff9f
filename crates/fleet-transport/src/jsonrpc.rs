use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JSON-RPC types spoken by the MCP transports.
// ---------------------------------------------------------------------------

/// MCP protocol version advertised on initialize.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

fn next_id() -> serde_json::Value {
    serde_json::Value::Number(NEXT_ID.fetch_add(1, Ordering::Relaxed).into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(next_id()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    /// A `tools/call` request for the given command and arguments.
    pub fn tool_call(command: &str, arguments: &serde_json::Value) -> Self {
        Self::new(
            "tools/call",
            Some(serde_json::json!({
                "name": command,
                "arguments": arguments,
            })),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Unwrap an MCP `tools/call` result into a plain JSON value.
///
/// MCP tool results arrive as `{"content": [{"type": "text", "text": ...}]}`.
/// When the text payload parses as JSON it is returned structured, otherwise
/// it is returned as a JSON string. Results without text content are
/// returned as-is.
pub fn tool_result_to_value(result: serde_json::Value) -> serde_json::Value {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
        })
        .and_then(|item| item.get("text"))
        .and_then(|t| t.as_str());

    match text {
        Some(text) => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        None => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = JsonRpcRequest::new("tools/list", None);
        let b = JsonRpcRequest::new("tools/list", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(n.id.is_none());
    }

    #[test]
    fn tool_call_shape() {
        let req = JsonRpcRequest::tool_call("get_status", &serde_json::json!({"verbose": true}));
        assert_eq!(req.method, "tools/call");
        let params = req.params.unwrap();
        assert_eq!(params["name"], "get_status");
        assert_eq!(params["arguments"]["verbose"], true);
    }

    #[test]
    fn tool_result_text_json_is_parsed() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "{\"uptime\": 42}"}]
        });
        let value = tool_result_to_value(result);
        assert_eq!(value["uptime"], 42);
    }

    #[test]
    fn tool_result_plain_text_stays_a_string() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "service restarted"}]
        });
        let value = tool_result_to_value(result);
        assert_eq!(value, serde_json::json!("service restarted"));
    }

    #[test]
    fn tool_result_without_content_passes_through() {
        let result = serde_json::json!({"raw": 1});
        let value = tool_result_to_value(result.clone());
        assert_eq!(value, result);
    }

    #[test]
    fn error_response_detected() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert!(resp.is_error());
        assert_eq!(
            resp.error.as_ref().map(|e| e.code),
            Some(error_codes::METHOD_NOT_FOUND)
        );
    }
}
