//! HTTP 会话协议
//!
//! - POST 无会话头且 method 为 initialize：创建会话，响应头返回 `mcp-session-id`
//! - POST 带已知会话头：交给该会话的 SessionTransport 处理
//! - POST 带未知会话头，或无会话头且不是 initialize：400 + `-32000`，不产生任何副作用
//! - GET 带已知会话头：SSE 流（服务端推送）；DELETE 带已知会话头：移除会话
//!
//! 会话表在显式关闭之外还有两条回收路径：空闲超过 TTL 的会话由 reaper 定期清理，
//! 会话数达到上限时新的 initialize 得到 503。
//!
//! SSE 流断开不会关闭会话（客户端可以重新 GET）。流存续期间 reaper 不回收该会话；
//! 流结束时刷新空闲时钟，TTL 从断开那一刻起算。

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSection;
use crate::mcp::protocol::{is_initialize, session_error, JsonRpcResponse, PARSE_ERROR, SESSION_HEADER};
use crate::mcp::server::ToolServer;

const NO_VALID_SESSION: &str = "Bad Request: No valid session ID provided";
const SESSIONS_FULL: &str = "Service Unavailable: session limit reached";

/// 绑定在一个会话上的传输实例
pub struct SessionTransport {
    id: String,
    server: ToolServer,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    events: broadcast::Sender<String>,
    closed: CancellationToken,
}

impl SessionTransport {
    fn new(id: String, server: ToolServer) -> Self {
        let (events, _) = broadcast::channel(64);
        let now = Instant::now();
        Self {
            id,
            server,
            created_at: now,
            last_seen: Mutex::new(now),
            events,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub async fn handle(&self, message: Value) -> Option<Value> {
        self.touch();
        self.server.handle(message).await
    }

    /// 向该会话的 SSE 订阅者推送一条报文，返回收到的订阅者数
    pub fn send(&self, message: &Value) -> usize {
        self.events.send(message.to_string()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.touch();
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 当前打开的 SSE 流数
    pub fn stream_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session limit reached ({0})")]
    Full(usize),
}

/// 会话表：会话 id → SessionTransport
pub struct SessionTable {
    sessions: RwLock<HashMap<String, Arc<SessionTransport>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::from_config(&ServerSection::default())
    }
}

impl SessionTable {
    pub fn new(max_sessions: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_ttl,
        }
    }

    pub fn from_config(cfg: &ServerSection) -> Self {
        Self::new(cfg.max_sessions, Duration::from_secs(cfg.session_idle_secs))
    }

    /// 创建并登记新会话；检查上限与插入在同一把写锁内完成
    pub async fn create(&self, server: ToolServer) -> Result<Arc<SessionTransport>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::Full(self.max_sessions));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let transport = Arc::new(SessionTransport::new(id.clone(), server));
        sessions.insert(id.clone(), Arc::clone(&transport));
        tracing::info!(session_id = %id, active = sessions.len(), "session created");
        Ok(transport)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionTransport>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SessionTransport>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = &removed {
            session.close();
            tracing::info!(session_id = %id, age_secs = session.age().as_secs(), "session closed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 移除空闲超过 TTL 的会话，返回移除数
    pub async fn reap_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.stream_count() == 0 && s.idle_for() >= self.idle_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.close();
            }
        }
        expired.len()
    }

    /// 周期性回收空闲会话，直到 shutdown 被取消
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        let expired = table.reap_expired().await;
                        if expired > 0 {
                            tracing::info!("Cleaned up {} idle sessions", expired);
                        }
                    }
                }
            }
        })
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!(closed = drained.len(), "all sessions closed");
        }
    }
}

#[derive(Clone)]
struct HttpState {
    server: ToolServer,
    sessions: Arc<SessionTable>,
}

pub fn router(server: ToolServer, sessions: Arc<SessionTable>, path: &str) -> Router {
    Router::new()
        .route(path, post(handle_post).get(handle_get).delete(handle_delete))
        .with_state(HttpState { server, sessions })
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn reject_session() -> Response {
    (StatusCode::BAD_REQUEST, Json(session_error(NO_VALID_SESSION))).into_response()
}

fn reply(session_id: &str, body: Option<Value>) -> Response {
    let mut response = match body {
        Some(v) => (StatusCode::OK, Json(v)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let err = JsonRpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err.to_value())).into_response();
        }
    };

    match session_header(&headers) {
        Some(id) => match state.sessions.get(id).await {
            Some(session) => {
                let out = session.handle(message).await;
                reply(id, out)
            }
            None => {
                tracing::warn!(session_id = %id, "unknown session");
                reject_session()
            }
        },
        None if is_initialize(&message) => match state.sessions.create(state.server.clone()).await {
            Ok(session) => {
                let out = session.handle(message).await;
                reply(session.id(), out)
            }
            Err(e) => {
                tracing::warn!("initialize refused: {e}");
                (StatusCode::SERVICE_UNAVAILABLE, Json(session_error(SESSIONS_FULL))).into_response()
            }
        },
        None => reject_session(),
    }
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(session) = (match session_header(&headers) {
        Some(id) => state.sessions.get(id).await,
        None => None,
    }) else {
        return reject_session();
    };

    let mut rx = session.subscribe();
    let closed = session.closed.clone();
    let guard = StreamGuard(Arc::clone(&session));
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            let msg = tokio::select! {
                _ = closed.cancelled() => break,
                msg = rx.recv() => msg,
            };
            match msg {
                Ok(text) => yield Ok::<_, Infallible>(Event::default().event("message").data(text)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "SSE client lagged, some messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(session.id()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// 随 SSE 流一起被丢弃；客户端断开时刷新会话的空闲时钟
struct StreamGuard(Arc<SessionTransport>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.touch();
        tracing::debug!(session_id = %self.0.id(), "SSE stream ended");
    }
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(id) = session_header(&headers) else {
        return reject_session();
    };
    match state.sessions.remove(id).await {
        Some(_) => StatusCode::OK.into_response(),
        None => reject_session(),
    }
}

/// 监听 bind_addr 并服务 HTTP 会话协议，直到 shutdown 被取消
pub async fn serve_http(
    server: ToolServer,
    sessions: Arc<SessionTable>,
    cfg: &ServerSection,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!("Tool server listening on http://{}{}", cfg.bind_addr, cfg.path);
    let reaper = sessions.spawn_reaper(Duration::from_secs(cfg.reap_interval_secs.max(1)), shutdown.clone());
    let app = router(server, Arc::clone(&sessions), &cfg.path);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    reaper.abort();
    sessions.close_all().await;
    result
}
