//! 客户端传输层
//!
//! 三种传输（子进程管道 / WebSocket / 会话复用 HTTP）实现同一个 Transport trait，
//! 由 ProviderDefinition 的 type 在运行时选择。管道与套接字共享 PendingRequests：
//! 请求 id 单调递增，读任务按 id 把响应交给等待方；连接关闭时所有等待方收到 Closed。
//! 出站报文统一交给 FrameWriter：每个连接一个写任务，整帧写完才处理下一帧。

pub mod http;
pub mod pipe;
pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderDefinition, TransportKind};
use crate::mcp::protocol::{JsonRpcResponse, PROTOCOL_VERSION};

pub use http::HttpTransport;
pub use pipe::PipeTransport;
pub use socket::SocketTransport;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("failed to spawn provider: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid provider definition: {0}")]
    InvalidDefinition(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// 统一的传输契约
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发送请求并等待对应 id 的响应（受连接超时约束）
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    /// 发送通知（无响应）
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// 关闭连接；挂起的请求以 Closed 结束
    async fn close(&self);

    fn kind(&self) -> TransportKind;

    fn is_alive(&self) -> bool;
}

type Waiter = oneshot::Sender<Result<Value, TransportError>>;

/// 等待响应的请求表
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<i64, Waiter>>,
    next_id: AtomicI64,
}

impl PendingRequests {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        })
    }

    pub(crate) async fn register(&self) -> (i64, oneshot::Receiver<Result<Value, TransportError>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        (id, rx)
    }

    pub(crate) async fn remove(&self, id: i64) {
        self.waiters.lock().await.remove(&id);
    }

    /// 连接终止：清空请求表，等待方收到 Closed
    pub(crate) async fn fail_all(&self) {
        let drained: Vec<Waiter> = self.waiters.lock().await.drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// 处理一条入站报文：有 id 的响应交给等待方，服务端通知仅记录
    pub(crate) async fn dispatch(&self, label: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(provider = %label, "unparseable frame: {e}");
                return;
            }
        };
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            tracing::debug!(provider = %label, method, "server message ignored");
            return;
        }
        let Some(id) = value.get("id").and_then(Value::as_i64) else {
            tracing::warn!(provider = %label, "response without numeric id");
            return;
        };
        let result = serde_json::from_value::<JsonRpcResponse>(value)
            .map_err(|e| TransportError::Protocol(e.to_string()))
            .and_then(JsonRpcResponse::into_result);
        if let Some(tx) = self.waiters.lock().await.remove(&id) {
            let _ = tx.send(result);
        }
    }
}

/// 关闭时给写任务留出的收尾时间（发送 Close 帧 / 关闭 stdin）
const CLOSE_GRACE: Duration = Duration::from_millis(500);

struct Outbound {
    frame: String,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// 连接的唯一写端
///
/// 调用方只把报文放进队列并等待写入结果；写任务独占 sink，逐帧 send（含 flush）。
/// 调用方的 future 中途被丢弃时，已经开始的帧仍会被完整写出。
/// closed 被取消后写任务退出，队列里剩余的报文以 Closed 结束。
pub(crate) struct FrameWriter {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameWriter {
    pub(crate) fn spawn<S, M, F>(
        label: String,
        mut sink: S,
        wrap: F,
        closed: CancellationToken,
        pending: Arc<PendingRequests>,
    ) -> Self
    where
        S: Sink<M> + Send + Unpin + 'static,
        S::Error: std::fmt::Display + Send,
        M: Send + 'static,
        F: Fn(String) -> M + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let token = closed.clone();
        let task = tokio::spawn(async move {
            loop {
                let outbound = tokio::select! {
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(outbound) => outbound,
                        None => break,
                    },
                };
                let written = tokio::select! {
                    _ = token.cancelled() => break,
                    result = sink.send(wrap(outbound.frame)) => result,
                };
                match written {
                    Ok(()) => {
                        let _ = outbound.done.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::warn!(provider = %label, "write failed: {e}");
                        let _ = outbound.done.send(Err(TransportError::Io(e.to_string())));
                        token.cancel();
                        pending.fail_all().await;
                        break;
                    }
                }
            }
            rx.close();
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
            tracing::debug!(provider = %label, "writer stopped");
        });
        Self {
            tx,
            closed,
            task: Mutex::new(Some(task)),
        }
    }

    /// 排队一帧并等待写入完成（背压来自写任务的 flush）
    pub(crate) async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (done, written) = oneshot::channel();
        self.tx
            .send(Outbound { frame, done })
            .map_err(|_| TransportError::Closed)?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = written => result.unwrap_or(Err(TransportError::Closed)),
        }
    }

    /// 取消写任务；收尾超过 CLOSE_GRACE 直接中止
    pub(crate) async fn stop(&self) {
        self.closed.cancel();
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// 等待某个请求的响应；超时后从请求表移除
pub(crate) async fn await_response(
    pending: &PendingRequests,
    id: i64,
    method: &str,
    rx: oneshot::Receiver<Result<Value, TransportError>>,
    timeout: Duration,
) -> Result<Value, TransportError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(TransportError::Closed),
        Err(_) => {
            pending.remove(id).await;
            Err(TransportError::Timeout(format!("{method} after {}s", timeout.as_secs_f32())))
        }
    }
}

/// initialize + notifications/initialized 握手，返回服务端 initialize 结果
pub async fn handshake(transport: &dyn Transport) -> Result<Value, TransportError> {
    let result = transport.request("initialize", Some(initialize_params())).await?;
    transport.notify("notifications/initialized", None).await?;
    Ok(result)
}

pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "hive", "version": env!("CARGO_PKG_VERSION")}
    })
}

/// 按定义建立传输。管道 / 套接字立即连接并握手；HTTP 延迟到首个请求
pub async fn open(def: &ProviderDefinition) -> Result<Arc<dyn Transport>, TransportError> {
    def.validate().map_err(TransportError::InvalidDefinition)?;
    let transport: Arc<dyn Transport> = match def.kind {
        TransportKind::Pipe => Arc::new(PipeTransport::spawn(def).await?),
        TransportKind::Socket => Arc::new(SocketTransport::connect(def).await?),
        TransportKind::Http => return Ok(Arc::new(HttpTransport::new(def)?)),
    };
    if let Err(e) = handshake(transport.as_ref()).await {
        transport.close().await;
        return Err(e);
    }
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_routes_by_id() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().await;
        pending
            .dispatch("t", &format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"ok":true}}}}"#))
            .await;
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_maps_rpc_error() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().await;
        pending
            .dispatch(
                "t",
                &format!(r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32601,"message":"nope"}}}}"#),
            )
            .await;
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::Rpc { code: -32601, message: "nope".to_string() });
    }

    #[tokio::test]
    async fn test_fail_all_resolves_waiters_with_closed() {
        let pending = PendingRequests::new();
        let (_, rx1) = pending.register().await;
        let (_, rx2) = pending.register().await;
        pending.fail_all().await;
        assert_eq!(rx1.await.unwrap(), Err(TransportError::Closed));
        assert_eq!(rx2.await.unwrap(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_await_response_timeout_clears_entry() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().await;
        let err = await_response(&pending, id, "tools/list", rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_incomplete_definition() {
        let def = ProviderDefinition::remote("x", TransportKind::Socket, " ");
        let err = open(&def).await.err().unwrap();
        assert!(matches!(err, TransportError::InvalidDefinition(_)));
    }
}
