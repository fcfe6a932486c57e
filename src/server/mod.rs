//! Gateway server surface: the inbound MCP protocol endpoint.
//!
//! The gateway is itself an MCP server — clients speak JSON-RPC 2.0 to it
//! (`initialize`, `tools/list`, `tools/call`) and every hangar tool call is
//! routed through [`tools::dispatch_tool`]. Transport submodules carry the
//! same handler over stdio and HTTP.

pub mod http;
pub mod stdio;
pub mod tools;

use std::sync::Arc;

use serde_json::{json, Value};

use crate::context::AppContext;
use crate::rpc::{JSONRPC_VERSION, MCP_PROTOCOL_VERSION};

/// Inbound MCP request handler shared by both transports.
#[derive(Clone)]
pub struct GatewayServer {
    ctx: Arc<AppContext>,
}

impl GatewayServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        GatewayServer { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Handle one inbound JSON-RPC message.
    ///
    /// Returns `None` for notifications (no id); requests always produce a
    /// response, including protocol errors for malformed or unknown input.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str);
        let params = message.get("params").cloned().unwrap_or(json!({}));

        let Some(method) = method else {
            // A message with neither method nor a known shape is unanswerable.
            return id.map(|id| protocol_error(id, -32600, "invalid request"));
        };

        // Notifications get processed but never answered.
        let Some(id) = id else {
            tracing::debug!(method = %method, "notification received");
            return None;
        };

        let result: Result<Value, String> = match method {
            "initialize" => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "hangar", "version": env!("CARGO_PKG_VERSION")},
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": tools::tool_definitions()})),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                let payload = tools::dispatch_tool(&self.ctx, name, &arguments).await;
                let is_error = payload.get("type").is_some() && payload.get("error").is_some();
                let text = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
                Ok(json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": is_error,
                }))
            }
            other => {
                tracing::debug!(method = %other, "unknown method");
                return Some(protocol_error(id, -32601, &format!("method not found: {other}")));
            }
        };

        match result {
            Ok(value) => Some(json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": value,
            })),
            Err(message) => Some(protocol_error(id, -32603, &message)),
        }
    }
}

fn protocol_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {"code": code, "message": message},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HangarConfig;
    use crate::context::bootstrap;

    fn server() -> GatewayServer {
        GatewayServer::new(bootstrap(HangarConfig::default()).expect("bootstrap"))
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let server = server();
        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2024-11-05", "capabilities": {}},
            }))
            .await
            .expect("response");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "hangar");
    }

    #[tokio::test]
    async fn test_tools_list_contains_gateway_tools() {
        let server = server();
        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await
            .expect("response");
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "hangar_call"));
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let server = server();
        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_is_protocol_error() {
        let server = server();
        let response = server
            .handle_message(json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
            .await
            .expect("response");
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_tools_call_wraps_payload_as_content() {
        let server = server();
        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "hangar_list", "arguments": {}},
            }))
            .await
            .expect("response");
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert!(payload["providers"].as_array().unwrap().is_empty());
        assert_eq!(response["result"]["isError"], false);
    }

    #[tokio::test]
    async fn test_tools_call_error_sets_is_error() {
        let server = server();
        let response = server
            .handle_message(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "hangar_details", "arguments": {"provider": "ghost"}},
            }))
            .await
            .expect("response");
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["type"], "ProviderNotFoundError");
    }
}
