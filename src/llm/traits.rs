//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式）。
//! 计划生成、参数生成与补丁决策都只需要一次完整回复。

use std::time::Duration;

use async_trait::async_trait;

use crate::llm::Message;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 带超时的完成调用；超时与后端错误统一为字符串错误
pub async fn complete_with_timeout(
    llm: &dyn LlmClient,
    messages: &[Message],
    timeout: Duration,
) -> Result<String, String> {
    match tokio::time::timeout(timeout, llm.complete(messages)).await {
        Ok(result) => result,
        Err(_) => Err(format!("LLM request timed out after {}s", timeout.as_secs())),
    }
}
