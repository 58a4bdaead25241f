//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Retry / Escalate / Degrade。

use thiserror::Error;

use crate::mcp::TransportError;
use crate::plan::PlanError;

/// 计划执行过程中可能出现的错误（配置、工具、传输、模型、补丁等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("External provider not connected: {0}")]
    UnknownProvider(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Argument generation failed: {0}")]
    ArgumentGeneration(String),

    #[error("Patch rejected: {0}")]
    PatchRejected(String),

    /// 某一步重试耗尽且没有补丁修复
    #[error("Step {step_id} failed after {attempts} attempts")]
    RetriesExhausted { step_id: String, attempts: usize },
}

impl AgentError {
    /// 是否属于配置类错误（快速失败，不重试）
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AgentError::Config(_)
                | AgentError::InvalidPlan(_)
                | AgentError::UnknownProvider(_)
                | AgentError::UnknownTool(_)
                | AgentError::Transport(TransportError::InvalidDefinition(_))
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 瞬时错误：记录历史后在上限内重试
    Retry,
    /// 本地有安全默认值：降级继续（如补丁控制器失败时视为 continue）
    Degrade,
    /// 配置类错误：直接上报为运行失败
    Escalate,
}
