//! OpenAI 兼容后端
//!
//! 计划生成、参数生成与补丁决策都是一问一答的非流式请求，这里只实现 complete。
//! base_url 可指向任意兼容端点；api_key 缺省时读 `OPENAI_API_KEY`。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{LlmClient, Message, Role};

/// 结构化输出需要稳定的回复
const DEFAULT_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Default)]
struct UsageCounters {
    prompt: AtomicU64,
    completion: AtomicU64,
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    usage: UsageCounters,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if key.is_empty() {
            tracing::warn!(model, "no API key configured, requests will be rejected by the endpoint");
        }
        let mut config = OpenAIConfig::new().with_api_key(key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            usage: UsageCounters::default(),
        }
    }

    pub fn from_section(section: &LlmSection) -> Self {
        Self::new(
            section.base_url.as_deref(),
            &section.model,
            section.api_key.as_deref(),
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage, String> {
    let content = message.content.clone();
    let built = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::User),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| format!("invalid {:?} message: {e}", message.role))
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages)
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| format!("{} request failed: {e}", self.model))?;

        if let Some(usage) = &response.usage {
            self.usage
                .prompt
                .fetch_add(u64::from(usage.prompt_tokens), Ordering::Relaxed);
            self.usage
                .completion
                .fetch_add(u64::from(usage.completion_tokens), Ordering::Relaxed);
        }

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| format!("{} returned no choices", self.model))?;
        Ok(choice.message.content.unwrap_or_default())
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let prompt = self.usage.prompt.load(Ordering::Relaxed);
        let completion = self.usage.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}
