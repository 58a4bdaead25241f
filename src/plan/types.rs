//! 计划类型定义
//!
//! 定义运行（Run）、计划（Plan）、步骤（Step）与计划校验错误等核心数据类型

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type RunId = String;
pub type StepId = String;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// 已接受目标，尚未开始执行
    Pending,
    /// 正在执行
    Running,
    /// 刚应用了补丁（瞬态，立即回到 Running）
    Patched,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// 计划中的一步：一次工具调用及其依赖与理由
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 计划内唯一；缺省时由 Plan::normalize 分配 `s_<uuid>`
    #[serde(default)]
    pub step_id: StepId,
    #[serde(default)]
    pub display_index: usize,
    #[serde(alias = "aiName")]
    pub tool_name: String,
    /// 依赖的 stepId 集合（只能指向更早的步骤）
    #[serde(default)]
    pub depends_on_step_ids: Vec<StepId>,
    #[serde(default, deserialize_with = "string_or_list")]
    #[schemars(with = "Vec<String>")]
    pub reason: Vec<String>,
    #[serde(default)]
    pub draft_args: Value,
    #[serde(default)]
    pub skip: bool,
}

impl Step {
    pub fn new(step_id: impl Into<StepId>, tool_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            display_index: 0,
            tool_name: tool_name.into(),
            depends_on_step_ids: Vec::new(),
            reason: Vec::new(),
            draft_args: Value::Object(Default::default()),
            skip: false,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.depends_on_step_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason.push(reason.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.draft_args = args;
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// 理由列表用 "; " 连接（渲染上下文时使用）
    pub fn reason_text(&self) -> String {
        self.reason.join("; ")
    }
}

/// reason 既可以是字符串也可以是字符串数组
fn string_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// 有序步骤序列，归属于某个 Run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// 补全缺失的 stepId、去重依赖、按位置重排 displayIndex（从 1 开始）
    pub fn normalize(&mut self) {
        normalize_steps(&mut self.steps);
    }

    /// 校验依赖不变式（见 graph::validate）
    pub fn validate(&self) -> Result<(), PlanError> {
        crate::plan::graph::validate(&self.steps)
    }

    /// normalize + validate，用于接收外部（配置文件 / LLM）给出的计划
    pub fn prepared(mut self) -> Result<Self, PlanError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }
}

pub(crate) fn normalize_steps(steps: &mut [Step]) {
    for (i, step) in steps.iter_mut().enumerate() {
        if step.step_id.trim().is_empty() {
            step.step_id = format!("s_{}", uuid::Uuid::new_v4().simple());
        } else {
            step.step_id = step.step_id.trim().to_string();
        }
        let mut seen = HashSet::new();
        step.depends_on_step_ids = step
            .depends_on_step_ids
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty() && seen.insert(d.clone()))
            .collect();
        step.display_index = i + 1;
    }
}

/// 一次端到端执行：一个目标、一份计划、一条历史流
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub objective: String,
    pub status: RunStatus,
    /// 接受目标时的计划快照（补丁控制器用作对照）
    pub initial_plan: Plan,
    pub created_at: i64,
}

impl Run {
    pub fn new(objective: impl Into<String>, initial_plan: Plan) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            objective: objective.into(),
            status: RunStatus::Pending,
            initial_plan,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 计划校验与补丁应用错误（均属配置类错误）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Duplicate step id: {0}")]
    DuplicateStepId(StepId),
    #[error("Step {step_id} depends on unknown step {dependency}")]
    UnknownDependency { step_id: StepId, dependency: StepId },
    #[error("Step {0} depends on itself")]
    SelfDependency(StepId),
    #[error("Step {step_id} depends on later step {dependency}")]
    ForwardDependency { step_id: StepId, dependency: StepId },
    #[error("Cyclic dependency detected at step {0}")]
    CyclicDependency(StepId),
    #[error("Step at index {index} is already executed and immutable")]
    ImmutableStep { index: usize },
    #[error("Step not found: {0}")]
    StepNotFound(StepId),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}
