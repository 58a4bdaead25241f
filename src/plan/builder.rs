//! 计划构建器
//!
//! 提供流畅的 API 来构建计划

use serde_json::Value;

use crate::plan::types::{Plan, PlanError, Step, StepId};

/// 计划构建器
#[derive(Default)]
pub struct PlanBuilder {
    steps: Vec<Step>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个步骤
    pub fn step(mut self, id: impl Into<StepId>, tool_name: impl Into<String>) -> Self {
        self.steps.push(Step::new(id, tool_name));
        self
    }

    /// 追加一个已构造的步骤
    pub fn push(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// 设置依赖（覆盖已有依赖）
    pub fn depends_on(mut self, id: &str, deps: &[&str]) -> Self {
        if let Some(step) = self.find(id) {
            step.depends_on_step_ids = deps.iter().map(|d| d.to_string()).collect();
        }
        self
    }

    /// 顺序依赖：`to` 依赖 `from`
    pub fn sequential(mut self, from: &str, to: &str) -> Self {
        if let Some(step) = self.find(to) {
            step.depends_on_step_ids.push(from.to_string());
        }
        self
    }

    pub fn reason(mut self, id: &str, reason: impl Into<String>) -> Self {
        if let Some(step) = self.find(id) {
            step.reason.push(reason.into());
        }
        self
    }

    pub fn args(mut self, id: &str, args: Value) -> Self {
        if let Some(step) = self.find(id) {
            step.draft_args = args;
        }
        self
    }

    pub fn skip(mut self, id: &str) -> Self {
        if let Some(step) = self.find(id) {
            step.skip = true;
        }
        self
    }

    fn find(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == id)
    }

    /// 构建计划（补全 id、重排 displayIndex 并校验依赖）
    pub fn build(self) -> Result<Plan, PlanError> {
        Plan::new(self.steps).prepared()
    }
}
