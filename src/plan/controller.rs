//! 计划补丁控制器
//!
//! 无状态服务：在配置的触发点（步骤完成后、重试后、失败时、每 N 步）调用一次 LLM，
//! 输出必须符合 PatchDecision 的固定形状。模型调用失败、超时或输出不合形状时，
//! 控制器降级为 `continue`，不会中断运行。关闭时直接返回 `continue`，不调用模型。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::RunnerSection;
use crate::llm::{compact_messages, complete_with_timeout, LlmClient, Message};
use crate::plan::context::clip;
use crate::plan::history::{HistoryEntry, HistoryKind};
use crate::plan::patch::PatchDecision;
use crate::plan::types::{Plan, Step};
use crate::tools::{schema_json, ToolDescriptor};

const LAST_RESULT_CAP: usize = 8000;
const REMAINING_PLAN_CAP: usize = 10000;
const INITIAL_PLAN_CAP: usize = 12000;
const RECENT_CONTEXT_CAP: usize = 12000;
const HISTORY_CAP: usize = 14000;
const TRIGGER_CAP: usize = 1000;

const SYSTEM_PROMPT: &str = "你是计划修补器。根据目标、最近的工具结果和剩余计划，判断是否需要调整尚未执行的步骤。\n\
- continue：计划无需调整；\n\
- patch：给出 operations，只能修改当前步骤之后的步骤（insert / remove / modify / set_dependencies）；\n\
- complete：目标已经达成，剩余步骤不再执行。\n\
依赖只能指向更早的步骤。只输出一个 JSON 对象，不要输出其他文字。";

/// 一次决策的输入
#[derive(Debug, Clone, Copy)]
pub struct PatchInput<'a> {
    pub objective: &'a str,
    pub plan: &'a Plan,
    /// 刚执行完（或失败）的步骤位置
    pub current_index: usize,
    /// 第一个尚未执行的位置；并行批次中它可能远在 current_index 之后
    pub cursor: usize,
    pub last_result: Option<&'a HistoryEntry>,
    pub initial_plan: &'a Plan,
    /// 本 run 的完整历史快照；控制器自行截取窗口
    pub history: &'a [HistoryEntry],
    pub trigger: &'a str,
    pub tools: &'a [ToolDescriptor],
}

/// 计划补丁控制器
pub struct PatchController {
    llm: Arc<dyn LlmClient>,
    enabled: bool,
    timeout: Duration,
    recent_window: usize,
}

impl PatchController {
    pub fn new(llm: Arc<dyn LlmClient>, enabled: bool) -> Self {
        Self {
            llm,
            enabled,
            timeout: Duration::from_secs(60),
            recent_window: 12,
        }
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, runner: &RunnerSection) -> Self {
        Self {
            llm,
            enabled: runner.enable_plan_patch,
            timeout: Duration::from_secs(runner.patch_timeout_secs),
            recent_window: runner.recent_history_window,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_recent_window(mut self, window: usize) -> Self {
        self.recent_window = window;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 给出补丁决策；任何失败都降级为 continue
    pub async fn decide(&self, input: &PatchInput<'_>) -> PatchDecision {
        if !self.enabled {
            return PatchDecision::continue_with("disabled");
        }
        let messages = self.build_messages(input);
        let raw = match complete_with_timeout(self.llm.as_ref(), &messages, self.timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, trigger = input.trigger, "plan patch failed (ignored)");
                return PatchDecision::continue_with("error");
            }
        };
        match parse_decision(&raw) {
            Ok(decision) => {
                tracing::debug!(action = ?decision.effective_action(), reason = %decision.reason, "plan patch decision");
                decision
            }
            Err(e) => {
                tracing::warn!(error = %e, "plan patch output rejected (ignored)");
                PatchDecision::continue_with("error")
            }
        }
    }

    pub fn build_messages(&self, input: &PatchInput<'_>) -> Vec<Message> {
        let current = input.plan.get(input.current_index);
        let display_index = current
            .map(|s| s.display_index)
            .unwrap_or(input.current_index + 1);
        let step_id = current.map(|s| s.step_id.as_str()).unwrap_or_default();

        let last_result = input
            .last_result
            .map(|e| serde_json::to_string_pretty(e).unwrap_or_default())
            .unwrap_or_else(|| "{}".to_string());
        let remaining_start = input
            .cursor
            .max(input.current_index + 1)
            .min(input.plan.len());
        let remaining = summarize_steps(&input.plan.steps, remaining_start);
        let initial = summarize_steps(&input.initial_plan.steps, 0);
        let window_start = input.history.len().saturating_sub(self.recent_window);
        let recent = summarize_recent(&input.history[window_start..]);
        let history = summarize_history(input.history);

        let manifest = input
            .tools
            .iter()
            .map(|t| format!("- {} ({}): {}", t.name, t.provider, t.description))
            .collect::<Vec<_>>()
            .join("\n");

        let user_task = format!(
            "目标: {objective}\n\
             当前步骤: {display_index}/{total} (stepId={step_id})\n\
             触发原因: {trigger}\n\n\
             最近一步结果(JSON):\n{last_result}\n\n\
             剩余计划(JSON):\n{remaining}\n\n\
             初始计划(JSON):\n{initial}\n\n\
             最近工具上下文(JSON):\n{recent}\n\n\
             执行历史(JSON):\n{history}\n\n\
             输出格式(JSON Schema):\n{schema}",
            objective = input.objective,
            total = input.plan.len(),
            trigger = clip(input.trigger, TRIGGER_CAP),
            last_result = clip(&last_result, LAST_RESULT_CAP),
            remaining = clip(&remaining, REMAINING_PLAN_CAP),
            initial = clip(&initial, INITIAL_PLAN_CAP),
            recent = clip(&recent, RECENT_CONTEXT_CAP),
            history = clip(&history, HISTORY_CAP),
            schema = schema_json::<PatchDecision>(),
        );

        compact_messages(vec![
            Message::system(SYSTEM_PROMPT),
            Message::assistant(manifest),
            Message::user(user_task),
        ])
    }
}

/// 从模型输出中取出 JSON 块：优先 ```json 围栏，否则取第一个 `{` / `[` 到与之对应的最后一个闭合符
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find(&['{', '['][..])?;
    let close = if trimmed[start..].starts_with('{') { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    (start <= end).then(|| &trimmed[start..=end])
}

/// 按固定形状解析补丁决策；形状之外的文本不被接受
pub fn parse_decision(output: &str) -> Result<PatchDecision, String> {
    let json_str = extract_json(output).ok_or_else(|| "no JSON object in output".to_string())?;
    let value: Value = serde_json::from_str(json_str).map_err(|e| e.to_string())?;
    if !value.is_object() || value.get("action").is_none() {
        return Err("output is not a patch decision".to_string());
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn summarize_steps(steps: &[Step], start: usize) -> String {
    let items: Vec<Value> = steps
        .iter()
        .enumerate()
        .skip(start)
        .map(|(i, s)| {
            json!({
                "index": i,
                "displayIndex": s.display_index,
                "stepId": s.step_id,
                "toolName": s.tool_name,
                "dependsOnStepIds": s.depends_on_step_ids,
                "reason": s.reason,
                "draftArgs": s.draft_args,
                "skip": s.skip,
            })
        })
        .collect();
    serde_json::to_string_pretty(&items).unwrap_or_default()
}

fn summarize_recent(entries: &[HistoryEntry]) -> String {
    let items: Vec<Value> = entries
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                HistoryKind::ToolResult | HistoryKind::ToolError | HistoryKind::ArggenError
            )
        })
        .map(|e| {
            json!({
                "type": e.kind,
                "plannedStepIndex": e.planned_step_index,
                "stepId": e.step_id,
                "toolName": e.tool_name,
                "args": e.args,
                "result": e.result,
                "error": e.error,
            })
        })
        .collect();
    serde_json::to_string_pretty(&items).unwrap_or_default()
}

fn summarize_history(entries: &[HistoryEntry]) -> String {
    let items: Vec<Value> = entries
        .iter()
        .map(|e| match e.kind {
            HistoryKind::ToolResult => json!({
                "type": e.kind,
                "plannedStepIndex": e.planned_step_index,
                "stepId": e.step_id,
                "toolName": e.tool_name,
                "result": e.result,
            }),
            HistoryKind::RetryBegin | HistoryKind::RetryDone => json!({
                "type": e.kind,
                "stepId": e.step_id,
                "attempt": e.attempt,
                "success": e.success,
            }),
            HistoryKind::PlanPatch => json!({
                "type": e.kind,
                "atIndex": e.planned_step_index,
                "reason": e.reason,
                "operations": e.operations,
                "applied": e.success,
            }),
            HistoryKind::ToolError | HistoryKind::ArggenError => json!({
                "type": e.kind,
                "stepId": e.step_id,
                "toolName": e.tool_name,
                "error": e.error,
            }),
        })
        .collect();
    serde_json::to_string_pretty(&items).unwrap_or_default()
}
