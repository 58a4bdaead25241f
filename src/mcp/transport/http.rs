//! 会话复用 HTTP 传输
//!
//! 首个请求前惰性完成 initialize 握手，并记住响应头里的 `mcp-session-id`，之后每个请求都带上它。
//! 响应体既可能是 JSON，也可能是 `text/event-stream`（取 `data:` 行里 id 匹配的那条）。
//! close() 发送 DELETE 结束服务端会话。

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{OnceCell, RwLock};

use crate::config::{ProviderDefinition, TransportKind};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, SESSION_HEADER};
use crate::mcp::transport::{initialize_params, Transport, TransportError};

pub struct HttpTransport {
    label: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    initialized: OnceCell<Value>,
    next_id: AtomicI64,
    alive: AtomicBool,
}

impl HttpTransport {
    /// 仅构建客户端，不发起网络请求
    pub fn new(def: &ProviderDefinition) -> Result<Self, TransportError> {
        let url = def
            .url
            .clone()
            .ok_or_else(|| TransportError::InvalidDefinition(format!("{} has no url", def.id)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(def.timeout_secs))
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &def.headers {
            let name = HeaderName::from_bytes(key.trim().as_bytes()).map_err(|e| {
                TransportError::InvalidDefinition(format!("invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                TransportError::InvalidDefinition(format!("invalid header value for '{key}': {e}"))
            })?;
            headers.insert(name, value);
        }

        Ok(Self {
            label: def.id.clone(),
            url,
            client,
            headers,
            session_id: RwLock::new(None),
            initialized: OnceCell::new(),
            next_id: AtomicI64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn ensure_initialized(&self) -> Result<(), TransportError> {
        self.initialized
            .get_or_try_init(|| async {
                let result = self.round_trip("initialize", Some(initialize_params())).await?;
                self.post(&JsonRpcRequest::notification("notifications/initialized", None))
                    .await?;
                let session = self.session_id().await;
                tracing::info!(provider = %self.label, session = ?session, "http provider initialized");
                Ok::<_, TransportError>(result)
            })
            .await?;
        Ok(())
    }

    async fn round_trip(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = self.post(&JsonRpcRequest::new(id, method, params)).await?;
        let response = find_response(&body, id)?;
        response.into_result()
    }

    /// POST 一条报文，返回响应体原文
    async fn post(&self, message: &JsonRpcRequest) -> Result<String, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(message);
        if let Some(session) = self.session_id().await {
            request = request.header(SESSION_HEADER, session);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<JsonRpcResponse>(&text) {
                err.into_result()?;
            }
            return Err(TransportError::Http(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.chars().take(400).collect::<String>()
            )));
        }
        Ok(text)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Http(e.to_string())
    }
}

/// 从 JSON 或 SSE 响应体中找出 id 匹配的响应
fn find_response(body: &str, id: i64) -> Result<JsonRpcResponse, TransportError> {
    let trimmed = body.trim();
    let candidates: Vec<&str> = if trimmed.starts_with('{') {
        vec![trimmed]
    } else {
        trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .collect()
    };
    candidates
        .into_iter()
        .filter_map(|text| serde_json::from_str::<JsonRpcResponse>(text).ok())
        .find(|resp| resp.id.as_i64() == Some(id))
        .ok_or_else(|| {
            TransportError::Protocol(format!(
                "no response for id {id} in body: {}",
                trimmed.chars().take(200).collect::<String>()
            ))
        })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if method == "initialize" {
            self.ensure_initialized().await?;
            return Ok(self.initialized.get().cloned().unwrap_or(Value::Null));
        }
        self.ensure_initialized().await?;
        self.round_trip(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.ensure_initialized().await?;
        self.post(&JsonRpcRequest::notification(method, params)).await?;
        Ok(())
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session_id.write().await.take() else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session.as_str())
            .send()
            .await;
        match result {
            Ok(resp) => {
                tracing::info!(provider = %self.label, session = %session, status = resp.status().as_u16(), "http session closed")
            }
            Err(e) => tracing::warn!(provider = %self.label, session = %session, "http session DELETE failed: {e}"),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_response_in_json_body() {
        let resp = find_response(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#, 3).unwrap();
        assert_eq!(resp.result.unwrap()["tools"], serde_json::json!([]));
    }

    #[test]
    fn test_find_response_in_event_stream() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{}}\n\n";
        let resp = find_response(body, 7).unwrap();
        assert_eq!(resp.id, serde_json::json!(7));
    }

    #[test]
    fn test_find_response_missing_id_is_protocol_error() {
        let err = find_response(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#, 2).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_new_rejects_bad_header() {
        let mut def = ProviderDefinition::remote("h", TransportKind::Http, "http://127.0.0.1:1/mcp");
        def.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            HttpTransport::new(&def),
            Err(TransportError::InvalidDefinition(_))
        ));
    }
}
