//! 工具服务端请求处理（与传输无关）
//!
//! 支持 initialize / ping / tools/list / tools/call 与 notifications/*；未知方法返回 -32601。
//! 工具执行结果统一映射为 `{content, structuredContent, isError}`。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::mcp::protocol::{
    call_tool_result, descriptor_to_wire, JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::tools::ToolRegistry;

/// 把本地 ToolRegistry 暴露为 JSON-RPC 服务
#[derive(Clone)]
pub struct ToolServer {
    registry: Arc<ToolRegistry>,
    name: String,
}

impl ToolServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            name: "hive".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 处理一条报文；通知返回 None
    pub async fn handle(&self, message: Value) -> Option<Value> {
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(r) => r,
            Err(e) => {
                return Some(
                    JsonRpcResponse::failure(Value::Null, INVALID_REQUEST, format!("Invalid Request: {e}"))
                        .to_value(),
                )
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize_result()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self.registry.descriptors().iter().map(descriptor_to_wire).collect();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => self.call_tool(id, request.params).await,
            other => {
                tracing::debug!(method = other, "method not found");
                JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}"))
            }
        };
        Some(response.to_value())
    }

    /// 处理一行文本；无法解析时返回 -32700
    pub async fn handle_text(&self, text: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(text) {
            Ok(message) => self.handle(message).await?,
            Err(e) => JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}")).to_value(),
        };
        Some(response.to_string())
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": self.name, "version": env!("CARGO_PKG_VERSION")}
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        if request.method.starts_with("notifications/") {
            tracing::debug!(method = %request.method, "notification received");
        } else {
            tracing::warn!(method = %request.method, "request without id ignored");
        }
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "tools/call requires params.name");
        };
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let outcome = self.registry.call(name, args).await;
        tracing::info!(tool = name, success = outcome.success, "tools/call");
        JsonRpcResponse::success(id, call_tool_result(&outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    fn server() -> ToolServer {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolServer::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_tools_list_carries_annotations() {
        let resp = server()
            .handle(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await
            .unwrap();
        let tool = &resp["result"]["tools"][0];
        assert_eq!(tool["name"], "echo");
        assert_eq!(tool["annotations"]["provider"], "local");
        assert_eq!(tool["annotations"]["cooldownMs"], 0);
    }

    #[tokio::test]
    async fn test_tools_call_failure_sets_is_error() {
        let resp = server()
            .handle(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "echo", "arguments": {}}}))
            .await
            .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        assert!(resp["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result_not_rpc_error() {
        let resp = server()
            .handle(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "nope"}}))
            .await
            .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(resp["result"]["structuredContent"]["error"]["code"], "unknown_tool");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = server()
            .handle(json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notification_has_no_response() {
        let resp = server()
            .handle(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_handle_text_parse_error() {
        let out = server().handle_text("{not json").await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["error"]["code"], PARSE_ERROR);
    }
}
