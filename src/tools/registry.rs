//! 工具注册表
//!
//! 所有本地工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 每次调用的结果统一为 ToolOutcome（`{success, data?, error?}`），本地与远端工具共用该信封；
//! ToolDescriptor 是注册表对外暴露的只读快照（含 provider / scope / tenant / cooldownMs）。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划 step 中的 toolName）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供参数生成器产出正确的参数格式）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn scope(&self) -> &str {
        "global"
    }

    fn tenant(&self) -> &str {
        "default"
    }

    fn cooldown_ms(&self) -> u64 {
        0
    }

    /// 执行工具；Err 中的字符串会成为 ToolOutcome.error.message
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具调用结果中的错误部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// 调用结果信封：每个工具（本地或远端）都产出这一形状
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolErrorInfo {
                message: message.into(),
                code: None,
            }),
        }
    }

    pub fn err_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolErrorInfo {
                message: message.into(),
                code: Some(code.into()),
            }),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// 从远端返回的任意 JSON 恢复信封：已是信封形状则直接解析，否则视为成功数据
    pub fn from_value(value: Value) -> Self {
        match value.get("success").and_then(Value::as_bool) {
            Some(_) => serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::ok(value)),
            None => Self::ok(value),
        }
    }
}

/// 工具来源：本地注册表或某个外部 provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolProvider {
    Local,
    External(String),
}

impl fmt::Display for ToolProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolProvider::Local => write!(f, "local"),
            ToolProvider::External(id) => write!(f, "external:{id}"),
        }
    }
}

impl std::str::FromStr for ToolProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ToolProvider::Local),
            other => match other.strip_prefix("external:") {
                Some(id) if !id.is_empty() => Ok(ToolProvider::External(id.to_string())),
                _ => Err(format!("invalid tool provider: {other}")),
            },
        }
    }
}

impl Serialize for ToolProvider {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ToolProvider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 工具描述快照（本地注册表 + 所有已连接 provider 汇总）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub provider: ToolProvider,
    pub scope: String,
    pub tenant: String,
    pub cooldown_ms: u64,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>；BTreeMap 保证 tools/list 输出顺序稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 调用本地工具；未知工具与执行失败都以失败信封返回，不抛错
    pub async fn call(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::err_with_code(format!("Unknown tool: {name}"), "unknown_tool");
        };
        match tool.execute(args).await {
            Ok(data) => ToolOutcome::ok(data),
            Err(e) => ToolOutcome::err(e),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 本地工具描述（provider = local）
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
                provider: ToolProvider::Local,
                scope: tool.scope().to_string(),
                tenant: tool.tenant().to_string(),
                cooldown_ms: tool.cooldown_ms(),
            })
            .collect()
    }
}
