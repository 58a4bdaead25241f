//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供计划执行引擎决定是重试、降级继续还是直接失败。

use crate::core::{AgentError, RecoveryAction};
use crate::mcp::TransportError;

/// 语义化错误恢复：将错误映射为可执行动作（重试 / 降级 / 上报）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn classify(&self, err: &AgentError) -> RecoveryAction {
        if err.is_configuration() {
            return RecoveryAction::Escalate;
        }
        match err {
            AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::ArgumentGeneration(_) => RecoveryAction::Retry,
            AgentError::Transport(
                TransportError::Closed
                | TransportError::Timeout(_)
                | TransportError::Io(_)
                | TransportError::Http(_)
                | TransportError::Rpc { .. }
                | TransportError::Protocol(_)
                | TransportError::Spawn(_),
            ) => RecoveryAction::Retry,
            AgentError::LlmError(_) | AgentError::PatchRejected(_) => RecoveryAction::Degrade,
            _ => RecoveryAction::Escalate,
        }
    }

    /// 是否应当再试一次：仅瞬时错误且仍有剩余次数
    pub fn should_retry(&self, err: &AgentError, attempt: usize, max_attempts: usize) -> bool {
        self.classify(err) == RecoveryAction::Retry && attempt < max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanError;

    #[test]
    fn test_recovery_tool_failure_retries() {
        let engine = RecoveryEngine::new();
        let err = AgentError::ToolExecutionFailed("boom".to_string());
        assert_eq!(engine.classify(&err), RecoveryAction::Retry);
        assert!(engine.should_retry(&err, 1, 3));
        assert!(!engine.should_retry(&err, 3, 3));
    }

    #[test]
    fn test_recovery_closed_transport_retries() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Transport(TransportError::Closed);
        assert_eq!(engine.classify(&err), RecoveryAction::Retry);
    }

    #[test]
    fn test_recovery_unknown_provider_escalates() {
        let engine = RecoveryEngine::new();
        let err = AgentError::UnknownProvider("ghost".to_string());
        assert_eq!(engine.classify(&err), RecoveryAction::Escalate);
        assert!(!engine.should_retry(&err, 1, 3));
    }

    #[test]
    fn test_recovery_invalid_plan_escalates() {
        let engine = RecoveryEngine::new();
        let err = AgentError::InvalidPlan(PlanError::ForwardDependency {
            step_id: "a".to_string(),
            dependency: "b".to_string(),
        });
        assert_eq!(engine.classify(&err), RecoveryAction::Escalate);
    }

    #[test]
    fn test_recovery_llm_error_degrades() {
        let engine = RecoveryEngine::new();
        let err = AgentError::LlmError("rate limited".to_string());
        assert_eq!(engine.classify(&err), RecoveryAction::Degrade);
    }
}
