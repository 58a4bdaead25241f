//! WebSocket 服务端：每个文本帧是一条 JSON-RPC 报文

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::mcp::server::ToolServer;

/// 接受连接直到 shutdown 被取消
pub async fn serve_socket(server: ToolServer, listener: TcpListener, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Tool server listening on ws://{}", addr);
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let server = server.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(server, stream, addr, shutdown).await {
                                tracing::warn!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                }
            }
        }
    }
    tracing::info!("Tool server socket listener stopped");
}

async fn handle_connection(
    server: ToolServer,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tracing::info!("New tool client from {}", addr);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
            None => break,
        };
        match msg {
            WsMessage::Text(text) => {
                let server = server.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = server.handle_text(&text).await {
                        let _ = tx.send(reply);
                    }
                });
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
    tracing::info!("Tool client {} disconnected", addr);
    Ok(())
}
