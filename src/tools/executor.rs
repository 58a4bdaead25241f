//! 工具调度器
//!
//! 持有本地 ToolRegistry、可选的 ClientManager 与全局超时。call(tool_name, args) 先按描述解析 provider：
//! 本地工具直接走注册表，外部工具经 ClientManager 转发；超时转为 AgentError::ToolTimeout（进入重试路径），
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::mcp::ClientManager;
use crate::tools::{ToolDescriptor, ToolOutcome, ToolProvider, ToolRegistry};

/// 工具调度器：对每次调用施加超时，本地 / 外部统一返回 ToolOutcome
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    clients: Option<ClientManager>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            clients: None,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_clients(mut self, clients: ClientManager) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 本地工具 + 所有已连接 provider 的工具；同名时本地优先
    pub async fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out = self.registry.descriptors();
        if let Some(clients) = &self.clients {
            for d in clients.list_all_tools().await {
                if !self.registry.contains(&d.name) {
                    out.push(d);
                }
            }
        }
        out
    }

    /// 解析工具所在 provider：本地注册表优先，其次是外部 provider 缓存的工具列表
    pub async fn resolve(&self, tool_name: &str) -> Option<ToolProvider> {
        if self.registry.contains(tool_name) {
            return Some(ToolProvider::Local);
        }
        let clients = self.clients.as_ref()?;
        clients
            .provider_for_tool(tool_name)
            .await
            .map(ToolProvider::External)
    }

    /// 调用工具；未知工具 / 未连接 provider 为配置类错误，超时为 ToolTimeout，传输失败为 Transport
    pub async fn call(&self, tool_name: &str, args: Value) -> Result<ToolOutcome, AgentError> {
        let provider = self
            .resolve(tool_name)
            .await
            .ok_or_else(|| AgentError::UnknownTool(tool_name.to_string()))?;
        self.call_on(&provider, tool_name, args).await
    }

    /// 在指定 provider 上调用工具
    pub async fn call_on(
        &self,
        provider: &ToolProvider,
        tool_name: &str,
        args: Value,
    ) -> Result<ToolOutcome, AgentError> {
        let start = Instant::now();
        let preview = args_preview(&args);

        let result = match provider {
            ToolProvider::Local => timeout(self.timeout, async {
                Ok::<_, AgentError>(self.registry.call(tool_name, args).await)
            })
            .await,
            ToolProvider::External(id) => {
                let clients = self
                    .clients
                    .as_ref()
                    .ok_or_else(|| AgentError::UnknownProvider(id.clone()))?;
                timeout(self.timeout, clients.call_tool(id, tool_name, args)).await
            }
        };

        let outcome_label = match &result {
            Ok(Ok(o)) if o.success => "ok",
            Ok(Ok(_)) => "error",
            Ok(Err(_)) => "transport_error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "provider": provider.to_string(),
            "ok": outcome_label == "ok",
            "outcome": outcome_label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AgentError::ToolTimeout(tool_name.to_string())),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
