//! 工具协议集成测试：HTTP 会话协议、连接幂等、三种传输端到端、管道关闭解除挂起调用

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use hive::config::{ProviderDefinition, TransportKind};
use hive::mcp::protocol::SESSION_HEADER;
use hive::mcp::server::{router, serve_socket};
use hive::mcp::transport::{PipeTransport, SocketTransport, Transport, TransportError};
use hive::mcp::{ClientManager, SessionTable, ToolServer};
use hive::tools::{EchoTool, ToolProvider, ToolRegistry};

fn tool_server() -> ToolServer {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    ToolServer::new(Arc::new(registry))
}

fn post(session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(id) = session {
        builder = builder.header(SESSION_HEADER, id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_http_session_lifecycle() {
    let sessions = Arc::new(SessionTable::default());
    let app = router(tool_server(), Arc::clone(&sessions), "/mcp");

    let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
    let response = app.clone().oneshot(post(None, init)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(sessions.len().await, 1);

    let call = json!({
        "jsonrpc": "2.0", "id": 2, "method": "tools/call",
        "params": {"name": "echo", "arguments": {"text": "routed"}}
    });
    let response = app
        .clone()
        .oneshot(post(Some(&session_id), call.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["isError"], false);
    assert_eq!(body["result"]["structuredContent"]["data"]["text"], "routed");

    let response = app
        .clone()
        .oneshot(post(Some("not-a-session"), call.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32000);
    assert!(body["id"].is_null());
    assert_eq!(sessions.len().await, 1);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header(SESSION_HEADER, session_id.as_str())
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(delete).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(sessions.is_empty().await);

    let response = app.oneshot(post(Some(&session_id), call)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_http_rejects_non_initialize_without_session() {
    let sessions = Arc::new(SessionTable::default());
    let app = router(tool_server(), Arc::clone(&sessions), "/mcp");

    let list = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
    let response = app.clone().oneshot(post(None, list)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], -32000);
    assert!(sessions.is_empty().await);

    let get = Request::builder()
        .method("GET")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(get).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_http_session_limit_returns_unavailable() {
    let sessions = Arc::new(SessionTable::new(1, Duration::from_secs(60)));
    let app = router(tool_server(), Arc::clone(&sessions), "/mcp");
    let init = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});

    let first = app.clone().oneshot(post(None, init.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.oneshot(post(None, init)).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(sessions.len().await, 1);
}

#[tokio::test]
async fn test_http_client_against_live_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sessions = Arc::new(SessionTable::default());
    let app = router(tool_server(), Arc::clone(&sessions), "/mcp");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let manager = ClientManager::new();
    let def = ProviderDefinition::remote("remote", TransportKind::Http, format!("http://{addr}/mcp"));
    manager.connect(&def).await.unwrap();
    assert!(sessions.is_empty().await);

    let tools = manager.list_all_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].provider, ToolProvider::External("remote".to_string()));
    assert_eq!(sessions.len().await, 1);

    let outcome = manager
        .call_tool("remote", "echo", json!({"text": "over http"}))
        .await
        .unwrap();
    assert_eq!(outcome.data, Some(json!({"text": "over http"})));

    manager.close_all().await;
    assert!(sessions.is_empty().await);
}

#[tokio::test]
async fn test_socket_connect_twice_yields_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_socket(tool_server(), listener, shutdown.clone()));

    let manager = ClientManager::new();
    let def = ProviderDefinition::remote("ws", TransportKind::Socket, format!("ws://{addr}"));
    let (a, b) = tokio::join!(manager.connect(&def), manager.connect(&def));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    manager.connect(&def).await.unwrap();
    assert_eq!(manager.connection_count().await, 1);

    let outcome = manager
        .call_tool("ws", "echo", json!({"text": "framed"}))
        .await
        .unwrap();
    assert!(outcome.success);

    manager.close_all().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_pipe_provider_end_to_end() {
    let manager = ClientManager::new();
    let def = ProviderDefinition::pipe(
        "child",
        env!("CARGO_BIN_EXE_hive-server"),
        vec!["pipe".to_string()],
    );
    let connected = manager.connect_all(&[def.clone()]).await.unwrap();
    assert_eq!(connected, 1);
    manager.connect_all(&[def]).await.unwrap();
    assert_eq!(manager.connection_count().await, 1);

    assert_eq!(manager.provider_for_tool("echo").await.as_deref(), Some("child"));
    let outcome = manager
        .call_tool("child", "echo", json!({"text": "via pipe"}))
        .await
        .unwrap();
    assert_eq!(outcome.data, Some(json!({"text": "via pipe"})));

    manager.close_all().await;
    assert_eq!(manager.connection_count().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_closing_pipe_unblocks_pending_call() {
    // cat 把请求原样回显，客户端永远等不到响应
    let def = ProviderDefinition::pipe("cat", "cat", vec![]).with_timeout_secs(30);
    let transport = Arc::new(PipeTransport::spawn(&def).await.unwrap());

    let pending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .request("tools/call", Some(json!({"name": "echo", "arguments": {}})))
                .await
        })
    };
    while transport.pending_count().await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    transport.close().await;

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending call should resolve after close")
        .unwrap();
    assert_eq!(result, Err(TransportError::Closed));
}

#[tokio::test]
async fn test_closing_socket_unblocks_pending_call() {
    // 对端完成握手后既不读也不回
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(ws);
    });

    let def = ProviderDefinition::remote("silent", TransportKind::Socket, format!("ws://{addr}"))
        .with_timeout_secs(30);
    let transport = Arc::new(SocketTransport::connect(&def).await.unwrap());
    let pending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .request("tools/call", Some(json!({"blob": "z".repeat(64 * 1024)})))
                .await
        })
    };
    while transport.pending_count().await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), transport.close())
        .await
        .expect("close should finish promptly");
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(TransportError::Closed));
    assert!(!transport.is_alive());
    silent.abort();
}
