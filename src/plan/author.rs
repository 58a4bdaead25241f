//! 计划生成：让模型根据目标与可用工具给出初始步骤列表

use std::time::Duration;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{complete_with_timeout, LlmClient, Message};
use crate::plan::controller::extract_json;
use crate::plan::types::{Plan, Step};
use crate::tools::ToolDescriptor;

const PLAN_SYSTEM: &str = "你是任务规划器。把目标拆成按顺序执行的工具调用步骤。\n\
输出 JSON：{\"steps\": [{\"stepId\": \"s1\", \"toolName\": \"...\", \"dependsOnStepIds\": [], \"reason\": [\"...\"], \"draftArgs\": {}}]}。\n\
dependsOnStepIds 只能引用更早的步骤；互不依赖的步骤可以并行。只输出 JSON。";

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Wrapped { steps: Vec<Step> },
    Bare(Vec<Step>),
}

/// 生成初始计划；输出无法解析、引用未知工具或违反依赖不变式时返回错误
pub async fn draft_plan(
    llm: &dyn LlmClient,
    objective: &str,
    tools: &[ToolDescriptor],
    timeout: Duration,
) -> Result<Plan, AgentError> {
    let manifest = tools
        .iter()
        .map(|t| format!("- {}: {} | 参数: {}", t.name, t.description, t.input_schema))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = vec![
        Message::system(PLAN_SYSTEM),
        Message::user(format!("可用工具:\n{manifest}\n\n目标: {objective}")),
    ];

    let raw = complete_with_timeout(llm, &messages, timeout)
        .await
        .map_err(AgentError::LlmError)?;
    let json_str = extract_json(&raw)
        .ok_or_else(|| AgentError::LlmError(format!("plan reply has no JSON: {raw}")))?;
    let reply: PlanReply = serde_json::from_str(json_str)
        .map_err(|e| AgentError::LlmError(format!("plan reply malformed: {e}")))?;
    let steps = match reply {
        PlanReply::Wrapped { steps } | PlanReply::Bare(steps) => steps,
    };

    if !tools.is_empty() {
        if let Some(unknown) = steps
            .iter()
            .find(|s| !tools.iter().any(|t| t.name == s.tool_name))
        {
            return Err(AgentError::UnknownTool(unknown.tool_name.clone()));
        }
    }

    let plan = Plan::new(steps).prepared()?;
    tracing::info!(steps = plan.len(), "plan drafted");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{EchoTool, ToolRegistry};

    fn tools() -> Vec<ToolDescriptor> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.descriptors()
    }

    #[tokio::test]
    async fn test_draft_plan_assigns_ids() {
        let llm = MockLlmClient::new(vec![
            r#"{"steps": [{"toolName": "echo", "reason": "first"}, {"stepId": "b", "toolName": "echo"}]}"#,
        ]);
        let plan = draft_plan(&llm, "say twice", &tools(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.steps[0].step_id.starts_with("s_"));
        assert_eq!(plan.steps[1].display_index, 2);
    }

    #[tokio::test]
    async fn test_draft_plan_rejects_unknown_tool() {
        let llm = MockLlmClient::new(vec![r#"[{"stepId": "a", "toolName": "launch"}]"#]);
        let err = draft_plan(&llm, "x", &tools(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(ref t) if t == "launch"));
    }

    #[tokio::test]
    async fn test_draft_plan_rejects_forward_dependency() {
        let llm = MockLlmClient::new(vec![
            r#"[{"stepId": "a", "toolName": "echo", "dependsOnStepIds": ["b"]}, {"stepId": "b", "toolName": "echo"}]"#,
        ]);
        let err = draft_plan(&llm, "x", &tools(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
