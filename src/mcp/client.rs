//! 外部工具提供方连接管理
//!
//! ClientManager 维护 provider id → ProviderConnection 的映射。每个 id 对应一个 OnceCell，
//! 同一 id 的并发 connect 只会真正建立一次连接，后来者等待先到者的结果；
//! 连接失败时 cell 保持未初始化，下次 connect 会重试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{OnceCell, RwLock};

use crate::config::{ProviderDefinition, TransportKind};
use crate::core::AgentError;
use crate::mcp::protocol::{descriptor_from_wire, outcome_from_call_result};
use crate::mcp::transport::{self, Transport, TransportError};
use crate::tools::{ToolDescriptor, ToolOutcome};

/// 一个已连接的 provider：传输 + 缓存的工具列表
pub struct ProviderConnection {
    pub id: String,
    pub kind: TransportKind,
    transport: Arc<dyn Transport>,
    cached_tools: RwLock<Option<Vec<ToolDescriptor>>>,
}

impl ProviderConnection {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            kind: transport.kind(),
            transport,
            cached_tools: RwLock::new(None),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// tools/list（首次调用后缓存）
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        if let Some(tools) = self.cached_tools.read().await.as_ref() {
            return Ok(tools.clone());
        }
        let tools = self.fetch_tools().await?;
        *self.cached_tools.write().await = Some(tools.clone());
        Ok(tools)
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.transport.request("tools/list", Some(json!({}))).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Protocol("tools/list result has no tools array".to_string()))?;
        Ok(tools
            .iter()
            .filter_map(|t| descriptor_from_wire(t, &self.id))
            .collect())
    }

    pub async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome, TransportError> {
        let result = self
            .transport
            .request("tools/call", Some(json!({"name": name, "arguments": args})))
            .await?;
        Ok(outcome_from_call_result(result))
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

type Slot = Arc<OnceCell<Arc<ProviderConnection>>>;

/// provider 连接表；Clone 后共享同一张表
#[derive(Clone, Default)]
pub struct ClientManager {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().await.entry(id.to_string()).or_default())
    }

    /// 连接一个 provider；同一 id 已连接（或正在连接）时复用
    pub async fn connect(&self, def: &ProviderDefinition) -> Result<Arc<ProviderConnection>, AgentError> {
        def.validate()
            .map_err(|e| AgentError::Transport(TransportError::InvalidDefinition(e)))?;
        let slot = self.slot(&def.id).await;
        let conn = slot
            .get_or_try_init(|| async move {
                tracing::info!(provider = %def.id, kind = %def.kind, "connecting provider");
                let transport = transport::open(def).await?;
                Ok::<_, TransportError>(Arc::new(ProviderConnection::new(def.id.clone(), transport)))
            })
            .await?;
        Ok(Arc::clone(conn))
    }

    /// 登记一个已建立的传输（嵌入方自带连接时使用）；id 已存在则保留原连接
    pub async fn attach(&self, id: &str, transport: Arc<dyn Transport>) -> Arc<ProviderConnection> {
        let slot = self.slot(id).await;
        let conn = slot
            .get_or_init(|| async move { Arc::new(ProviderConnection::new(id, transport)) })
            .await;
        Arc::clone(conn)
    }

    /// 连接全部 provider，返回成功数
    ///
    /// 定义不完整或 id 重复属于配置错误，直接返回；单个 provider 连接失败只记录日志。
    pub async fn connect_all(&self, defs: &[ProviderDefinition]) -> Result<usize, AgentError> {
        let mut seen = HashSet::new();
        for def in defs {
            def.validate()
                .map_err(|e| AgentError::Transport(TransportError::InvalidDefinition(e)))?;
            if !seen.insert(def.id.as_str()) {
                return Err(AgentError::Config(format!("duplicate provider id: {}", def.id)));
            }
        }

        let results = join_all(defs.iter().map(|def| self.connect(def))).await;
        let mut connected = 0;
        for (def, result) in defs.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(e) => tracing::warn!(provider = %def.id, error = %e, "provider connect failed"),
            }
        }
        tracing::info!(connected, total = defs.len(), "providers connected");
        Ok(connected)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ProviderConnection>> {
        self.slots.read().await.get(id).and_then(|slot| slot.get().cloned())
    }

    /// 已建立的连接，按 id 排序
    async fn connections(&self) -> Vec<Arc<ProviderConnection>> {
        let mut conns: Vec<_> = self
            .slots
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        conns.sort_by(|a, b| a.id.cmp(&b.id));
        conns
    }

    pub async fn connection_count(&self) -> usize {
        self.connections().await.len()
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    /// 汇总所有 provider 的工具，标记为 `external:<id>`；单个 provider 失败不影响其它
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        let conns = self.connections().await;
        let listed = join_all(conns.iter().map(|c| c.list_tools())).await;
        let mut out = Vec::new();
        for (conn, result) in conns.iter().zip(listed) {
            match result {
                Ok(tools) => out.extend(tools),
                Err(e) => tracing::warn!(provider = %conn.id, error = %e, "tools/list failed, provider skipped"),
            }
        }
        out
    }

    pub async fn provider_for_tool(&self, tool_name: &str) -> Option<String> {
        self.list_all_tools()
            .await
            .into_iter()
            .find(|d| d.name == tool_name)
            .and_then(|d| match d.provider {
                crate::tools::ToolProvider::External(id) => Some(id),
                crate::tools::ToolProvider::Local => None,
            })
    }

    /// 在指定 provider 上调用工具；provider 未连接为 UnknownProvider
    pub async fn call_tool(
        &self,
        provider_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<ToolOutcome, AgentError> {
        let conn = self
            .get(provider_id)
            .await
            .ok_or_else(|| AgentError::UnknownProvider(provider_id.to_string()))?;
        Ok(conn.call_tool(tool_name, args).await?)
    }

    /// 关闭并移除一个 provider
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.slots.write().await.remove(id);
        match removed.and_then(|slot| slot.get().cloned()) {
            Some(conn) => {
                conn.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Slot> = self.slots.write().await.drain().map(|(_, slot)| slot).collect();
        for conn in drained.iter().filter_map(|slot| slot.get()) {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::server::{serve_lines, ToolServer};
    use crate::mcp::transport::PipeTransport;
    use crate::tools::{EchoTool, ToolProvider, ToolRegistry};
    use std::time::Duration;

    /// 进程内 provider：ToolServer 跑在 duplex 的另一端
    fn in_process_transport() -> Arc<dyn Transport> {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let server = ToolServer::new(Arc::new(registry));
        tokio::spawn(async move {
            let _ = serve_lines(server, server_read, server_write).await;
        });
        Arc::new(PipeTransport::from_io(
            "local-echo",
            client_read,
            client_write,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_attached_provider_tools_are_tagged() {
        let manager = ClientManager::new();
        manager.attach("echoer", in_process_transport()).await;
        let tools = manager.list_all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].provider, ToolProvider::External("echoer".to_string()));
        assert_eq!(manager.provider_for_tool("echo").await.as_deref(), Some("echoer"));
    }

    #[tokio::test]
    async fn test_call_tool_through_provider() {
        let manager = ClientManager::new();
        manager.attach("echoer", in_process_transport()).await;
        let outcome = manager
            .call_tool("echoer", "echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data, Some(json!({"text": "hi"})));

        let failed = manager.call_tool("echoer", "echo", json!({})).await.unwrap();
        assert!(!failed.success);
    }

    #[tokio::test]
    async fn test_call_unknown_provider_is_configuration_error() {
        let manager = ClientManager::new();
        let err = manager.call_tool("ghost", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownProvider(ref id) if id == "ghost"));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_listing_failure_is_isolated() {
        let manager = ClientManager::new();
        manager.attach("good", in_process_transport()).await;
        let broken = in_process_transport();
        broken.close().await;
        manager.attach("broken", broken).await;

        let tools = manager.list_all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(manager.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_connect_all_rejects_duplicate_ids() {
        let manager = ClientManager::new();
        let defs = vec![
            ProviderDefinition::pipe("a", "x", vec![]),
            ProviderDefinition::pipe("a", "y", vec![]),
        ];
        let err = manager.connect_all(&defs).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_connect_all_skips_unspawnable_provider() {
        let manager = ClientManager::new();
        let defs = vec![ProviderDefinition::pipe(
            "missing",
            "/definitely/not/a/real/binary",
            vec![],
        )];
        assert_eq!(manager.connect_all(&defs).await.unwrap(), 0);
        assert!(!manager.is_connected("missing").await);
    }

    #[tokio::test]
    async fn test_close_removes_connection() {
        let manager = ClientManager::new();
        manager.attach("echoer", in_process_transport()).await;
        assert!(manager.close("echoer").await);
        assert!(!manager.is_connected("echoer").await);
        assert!(!manager.close("echoer").await);
    }
}
