//! 子进程管道传输：换行分隔的 JSON over stdin / stdout
//!
//! LinesCodec 负责跨读块缓冲半行，每行恰好解析一个 JSON 文档。写方向由 FrameWriter 独占 stdin，
//! 一行写完并 flush 后才回应发送方。子进程退出（stdout EOF）或 close() 后连接标记为关闭，
//! 所有挂起请求以 TransportError::Closed 结束。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderDefinition, TransportKind};
use crate::mcp::protocol::JsonRpcRequest;
use crate::mcp::transport::{
    await_response, FrameWriter, PendingRequests, Transport, TransportError,
};

pub struct PipeTransport {
    label: String,
    writer: FrameWriter,
    pending: Arc<PendingRequests>,
    closed: CancellationToken,
    timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl PipeTransport {
    /// 启动子进程并接管其 stdin / stdout；stderr 逐行记 debug 日志
    pub async fn spawn(def: &ProviderDefinition) -> Result<Self, TransportError> {
        let command = def
            .command
            .as_deref()
            .ok_or_else(|| TransportError::InvalidDefinition(format!("{} has no command", def.id)))?;
        let mut child = Command::new(command)
            .args(&def.args)
            .envs(&def.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let label = def.id.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!(provider = %label, "stderr: {line}");
                }
            });
        }

        tracing::info!(provider = %def.id, command, pid = ?child.id(), "pipe provider spawned");
        let transport = Self::from_io(
            def.id.clone(),
            stdout,
            stdin,
            Duration::from_secs(def.timeout_secs),
        );
        *transport.child.lock().await = Some(child);
        Ok(transport)
    }

    /// 基于任意读写端构建（测试中用 tokio::io::duplex 代替子进程）
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = PendingRequests::new();
        let closed = CancellationToken::new();

        let reader_task = {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let mut frames = FramedRead::new(reader, LinesCodec::new());
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = frames.next() => frame,
                    };
                    match frame {
                        Some(Ok(line)) => pending.dispatch(&label, &line).await,
                        Some(Err(e)) => {
                            tracing::warn!(provider = %label, "pipe read failed: {e}");
                            break;
                        }
                        None => {
                            tracing::info!(provider = %label, "pipe closed by provider");
                            break;
                        }
                    }
                }
                closed.cancel();
                pending.fail_all().await;
            })
        };

        let writer = FrameWriter::spawn(
            label.clone(),
            FramedWrite::new(writer, LinesCodec::new()),
            |line: String| line,
            closed.clone(),
            Arc::clone(&pending),
        );

        Self {
            label,
            writer,
            pending,
            closed,
            timeout,
            reader: Mutex::new(Some(reader_task)),
            child: Mutex::new(None),
        }
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<(), TransportError> {
        let line =
            serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.writer.send(line).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }
}

#[async_trait]
impl Transport for PipeTransport {
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
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(provider = %self.label, "kill failed: {e}");
            }
        }
        self.pending.fail_all().await;
        tracing::info!(provider = %self.label, "pipe transport closed");
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_request_matches_response_split_across_chunks() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);
        let transport = Arc::new(PipeTransport::from_io(
            "t",
            client_read,
            client_write,
            Duration::from_secs(5),
        ));

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = format!(
                r#"{{"jsonrpc":"2.0","id":{},"result":{{"pong":true}}}}"#,
                req["id"]
            );
            let (head, tail) = reply.split_at(10);
            server_write.write_all(head.as_bytes()).await.unwrap();
            server_write.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server_write.write_all(tail.as_bytes()).await.unwrap();
            server_write.write_all(b"\n").await.unwrap();
            server_write.flush().await.unwrap();
        });

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_request() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let transport = Arc::new(PipeTransport::from_io(
            "t",
            client_read,
            client_write,
            Duration::from_secs(30),
        ));

        let caller = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.request("tools/call", None).await })
        };
        while transport.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        transport.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_provider_eof_marks_closed() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_side);
        let transport = PipeTransport::from_io("t", client_read, client_write, Duration::from_secs(5));
        drop(server_side);
        for _ in 0..100 {
            if !transport.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!transport.is_alive());
        assert_eq!(transport.request("ping", None).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_returns_while_provider_stops_reading() {
        // 报文比管道缓冲大，对端从不读取，写任务卡在 flush 上
        let (client_side, _server_side) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_side);
        let transport = Arc::new(PipeTransport::from_io(
            "t",
            client_read,
            client_write,
            Duration::from_secs(30),
        ));

        let caller = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .request("tools/call", Some(json!({"blob": "x".repeat(10_000)})))
                    .await
            })
        };
        while transport.pending_count().await == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close should not wait on a blocked write");
        let result = tokio::time::timeout(Duration::from_secs(2), caller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));
        assert_eq!(transport.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_still_writes_whole_line() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);
        let transport = Arc::new(PipeTransport::from_io(
            "t",
            client_read,
            client_write,
            Duration::from_secs(5),
        ));

        // 对端尚未读取，调用方在写到一半时放弃
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            transport.request("tools/call", Some(json!({"blob": "y".repeat(4_000)}))),
        )
        .await;
        assert!(abandoned.is_err());

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap())
                .expect("first line must be a complete document");
            assert_eq!(first["params"]["blob"].as_str().map(str::len), Some(4_000));

            let second: Value =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let reply = format!(r#"{{"jsonrpc":"2.0","id":{},"result":{{"ok":true}}}}"#, second["id"]);
            server_write.write_all(reply.as_bytes()).await.unwrap();
            server_write.write_all(b"\n").await.unwrap();
            server_write.flush().await.unwrap();
        });

        let result = transport.request("ping", None).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        server.await.unwrap();
    }
}
