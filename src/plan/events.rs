//! 计划执行过程中的事件（供 CLI / 调用方展示进度）

use serde::Serialize;

use crate::plan::types::{RunId, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        steps: usize,
    },
    /// 开始执行某一步
    StepStarted {
        run_id: RunId,
        index: usize,
        step_id: String,
        tool: String,
    },
    StepFinished {
        run_id: RunId,
        index: usize,
        step_id: String,
        success: bool,
    },
    /// 进入第 attempt 次尝试
    Retry {
        run_id: RunId,
        step_id: String,
        attempt: usize,
        error: String,
    },
    PatchApplied {
        run_id: RunId,
        at_index: usize,
        operations: usize,
        reason: String,
    },
    /// 补丁违反不变式被整体拒绝
    PatchRejected {
        run_id: RunId,
        at_index: usize,
        error: String,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}
