//! 参数生成
//!
//! 执行每一步前先产出工具参数。DraftArgsGenerator 直接使用计划里的 draftArgs；
//! LlmArgumentGenerator 把依赖上下文交给模型，要求输出一个 JSON 对象。
//! 生成失败由引擎记为 arggen_error 并进入重试路径。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{compact_messages, complete_with_timeout, LlmClient, Message};
use crate::plan::controller::extract_json;
use crate::plan::types::Step;
use crate::tools::ToolDescriptor;

/// 一次参数生成请求
#[derive(Debug, Clone, Copy)]
pub struct ArgRequest<'a> {
    pub run_id: &'a str,
    pub objective: &'a str,
    pub index: usize,
    pub step: &'a Step,
    /// 依赖上下文（一问一答）
    pub context: &'a [Message],
    /// 「依赖结果(JSON)」证据块
    pub dependent: Option<&'a Message>,
    pub tool: Option<&'a ToolDescriptor>,
    pub attempt: usize,
}

#[async_trait]
pub trait ArgumentGenerator: Send + Sync {
    async fn generate(&self, request: ArgRequest<'_>) -> Result<Value, String>;
}

/// 使用计划给出的 draftArgs
#[derive(Debug, Default, Clone, Copy)]
pub struct DraftArgsGenerator;

#[async_trait]
impl ArgumentGenerator for DraftArgsGenerator {
    async fn generate(&self, request: ArgRequest<'_>) -> Result<Value, String> {
        Ok(match &request.step.draft_args {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        })
    }
}

const ARGGEN_SYSTEM: &str = "你是工具参数生成器。根据目标、前序步骤的参数与结果，为当前步骤生成工具参数。\
只输出一个 JSON 对象，字段必须符合工具的参数 schema。";

/// 由 LLM 生成参数
pub struct LlmArgumentGenerator {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmArgumentGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    fn build_messages(&self, request: &ArgRequest<'_>) -> Vec<Message> {
        let step = request.step;
        let schema = request
            .tool
            .map(|t| t.input_schema.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let mut task = format!(
            "目标: {}\n当前步骤: {} (stepId={})\n工具: {}\n原因: {}\n参数 schema: {}\n草稿参数: {}",
            request.objective,
            step.display_index,
            step.step_id,
            step.tool_name,
            step.reason_text(),
            schema,
            step.draft_args,
        );
        if let Some(dep) = request.dependent {
            task.push_str("\n\n");
            task.push_str(&dep.content);
        }
        if request.attempt > 1 {
            task.push_str(&format!("\n\n这是第 {} 次尝试，请参考上一轮失败修正参数。", request.attempt));
        }

        let mut messages = vec![Message::system(ARGGEN_SYSTEM)];
        messages.extend(request.context.iter().cloned());
        messages.push(Message::user(task));
        compact_messages(messages)
    }
}

#[async_trait]
impl ArgumentGenerator for LlmArgumentGenerator {
    async fn generate(&self, request: ArgRequest<'_>) -> Result<Value, String> {
        let messages = self.build_messages(&request);
        let raw = complete_with_timeout(self.llm.as_ref(), &messages, self.timeout).await?;
        let json_str = extract_json(&raw).ok_or_else(|| format!("no JSON object in output: {raw}"))?;
        let value: Value = serde_json::from_str(json_str).map_err(|e| format!("{e}: {json_str}"))?;
        if !value.is_object() {
            return Err(format!("arguments must be a JSON object, got: {value}"));
        }
        Ok(value)
    }
}
