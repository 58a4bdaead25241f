//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预设回复；回复用完后返回默认回复（默认是 continue 决策）。同时记录每次收到的消息，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：脚本化回复
#[derive(Debug)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    default_response: String,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl MockLlmClient {
    pub fn new<S: Into<String>>(responses: Vec<S>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            default_response: r#"{"action": "continue", "isComplete": false, "reason": "mock", "operations": []}"#
                .to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条失败回复（模拟后端错误）
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(error.into()));
        }
    }

    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// 已收到的调用次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok().and_then(|c| c.get(n).cloned())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}
