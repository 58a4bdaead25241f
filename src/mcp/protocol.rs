//! JSON-RPC 2.0 报文与工具协议映射
//!
//! 客户端传输与服务端共用：请求 / 响应 / 错误结构，工具描述的线上形状（含 annotations），
//! 以及 ToolOutcome 与 `tools/call` 结果 `{content, structuredContent, isError}` 之间的互转。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::mcp::transport::TransportError;
use crate::tools::{ToolDescriptor, ToolOutcome, ToolProvider};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";
/// HTTP 会话标识所在请求 / 响应头
pub const SESSION_HEADER: &str = "mcp-session-id";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// 会话协议错误（缺少或未知的会话标识、会话已满）
pub const SESSION_ERROR: i64 = -32000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// 通知没有 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// 错误响应转为 TransportError::Rpc，成功响应取 result（缺省为 null）
    pub fn into_result(self) -> Result<Value, TransportError> {
        match self.error {
            Some(e) => Err(TransportError::Rpc {
                code: e.code,
                message: e.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// 会话协议错误体：`{jsonrpc, error:{code:-32000, message}, id:null}`
pub fn session_error(message: &str) -> Value {
    JsonRpcResponse::failure(Value::Null, SESSION_ERROR, message).to_value()
}

/// 请求体是否为 initialize（用于 HTTP 会话创建判定）
pub fn is_initialize(body: &Value) -> bool {
    body.get("method").and_then(Value::as_str) == Some("initialize")
}

/// 本地工具描述 → `tools/list` 条目
pub fn descriptor_to_wire(d: &ToolDescriptor) -> Value {
    json!({
        "name": d.name,
        "description": d.description,
        "inputSchema": d.input_schema,
        "annotations": {
            "scope": d.scope,
            "tenant": d.tenant,
            "provider": d.provider.to_string(),
            "cooldownMs": d.cooldown_ms,
        }
    })
}

/// `tools/list` 条目 → 描述，provider 标记为 `external:<id>`；缺少 name 的条目丢弃
pub fn descriptor_from_wire(tool: &Value, provider_id: &str) -> Option<ToolDescriptor> {
    let name = tool.get("name")?.as_str()?.to_string();
    let annotations = tool.get("annotations");
    let annotation_str = |key: &str, default: &str| {
        annotations
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };
    Some(ToolDescriptor {
        name,
        description: tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema: tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
        provider: ToolProvider::External(provider_id.to_string()),
        scope: annotation_str("scope", "global"),
        tenant: annotation_str("tenant", "default"),
        cooldown_ms: annotations
            .and_then(|a| a.get("cooldownMs"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

/// ToolOutcome → `tools/call` 结果
pub fn call_tool_result(outcome: &ToolOutcome) -> Value {
    let text = if outcome.success {
        match &outcome.data {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    } else {
        format!("Error: {}", outcome.error_message().unwrap_or("unknown error"))
    };
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": outcome,
        "isError": !outcome.success,
    })
}

/// `tools/call` 结果 → ToolOutcome
///
/// 有 structuredContent 时优先使用；否则拼接文本内容，isError 为真时视为失败。
pub fn outcome_from_call_result(result: Value) -> ToolOutcome {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(structured) = result.get("structuredContent").cloned() {
        let outcome = ToolOutcome::from_value(structured);
        if is_error && outcome.success {
            return ToolOutcome::err(render_content(&result));
        }
        return outcome;
    }
    let text = render_content(&result);
    if is_error {
        let message = text.strip_prefix("Error: ").unwrap_or(&text).to_string();
        ToolOutcome::err(message)
    } else {
        ToolOutcome::ok(Value::String(text))
    }
}

fn render_content(result: &Value) -> String {
    let Some(items) = result.get("content").and_then(Value::as_array) else {
        return result.to_string();
    };
    items
        .iter()
        .map(|item| match item.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
