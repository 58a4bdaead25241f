//! WebSocket 传输：每个 JSON-RPC 报文是一个文本帧
//!
//! 写半边交给 FrameWriter 独占，读任务按 id 分发响应。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderDefinition, TransportKind};
use crate::mcp::protocol::JsonRpcRequest;
use crate::mcp::transport::{
    await_response, FrameWriter, PendingRequests, Transport, TransportError,
};

pub struct SocketTransport {
    label: String,
    writer: FrameWriter,
    pending: Arc<PendingRequests>,
    closed: CancellationToken,
    timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    pub async fn connect(def: &ProviderDefinition) -> Result<Self, TransportError> {
        let url = def
            .url
            .as_deref()
            .ok_or_else(|| TransportError::InvalidDefinition(format!("{} has no url", def.id)))?;
        let timeout = Duration::from_secs(def.timeout_secs);
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect {url}")))?
            .map_err(|e| TransportError::Io(format!("websocket connect {url}: {e}")))?;
        tracing::info!(provider = %def.id, url, "socket provider connected");

        let (sink, mut stream) = ws_stream.split();
        let pending = PendingRequests::new();
        let closed = CancellationToken::new();

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let label = def.id.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = closed.cancelled() => break,
                        msg = stream.next() => msg,
                    };
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => pending.dispatch(&label, &text).await,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(provider = %label, "websocket receive error: {e}");
                            break;
                        }
                    }
                }
                closed.cancel();
                pending.fail_all().await;
            })
        };

        let writer = FrameWriter::spawn(
            def.id.clone(),
            sink,
            WsMessage::Text,
            closed.clone(),
            Arc::clone(&pending),
        );

        Ok(Self {
            label: def.id.clone(),
            writer,
            pending,
            closed,
            timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.writer.send(text).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let (id, rx) = self.pending.register().await;
        if let Err(e) = self.send(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.remove(id).await;
            return Err(e);
        }
        await_response(&self.pending, id, method, rx, self.timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&self) {
        self.closed.cancel();
        let reader = self.reader.lock().await.take();
        if let Some(task) = reader {
            task.abort();
        }
        self.writer.stop().await;
        self.pending.fail_all().await;
        tracing::info!(provider = %self.label, "socket transport closed");
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }
}
