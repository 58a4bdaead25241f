//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use message::{compact_messages, Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{complete_with_timeout, LlmClient};

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端：provider = "mock" 时使用脚本化 Mock，其余走 OpenAI 兼容端点
pub fn create_llm_client(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.as_str() {
        "mock" => Arc::new(MockLlmClient::default()),
        _ => Arc::new(OpenAiClient::from_section(section)),
    }
}
