//! 计划补丁
//!
//! PatchOperation 只能编辑计划中尚未执行的后缀（插入 / 删除 / 修改步骤及其依赖）。
//! 应用补丁产生新的步骤列表，原计划不被原地修改；任一操作触及已执行位置、或结果违反依赖不变式，
//! 整个补丁被拒绝，调用方手中的计划保持不变。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::types::{normalize_steps, PlanError, Step, StepId};

/// 单个补丁操作（以 `op` 字段区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOperation {
    /// 在计划位置 `at` 之前插入（`at` 等于步骤数时追加到末尾）
    Insert {
        #[serde(alias = "atIndex")]
        at: usize,
        step: Step,
    },
    Remove {
        #[serde(rename = "stepId")]
        step_id: StepId,
    },
    /// 只修改给出的字段
    Modify {
        #[serde(rename = "stepId")]
        step_id: StepId,
        #[serde(rename = "toolName", default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<Vec<String>>,
        #[serde(rename = "draftArgs", default, skip_serializing_if = "Option::is_none")]
        draft_args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip: Option<bool>,
    },
    SetDependencies {
        #[serde(rename = "stepId")]
        step_id: StepId,
        #[serde(rename = "dependsOnStepIds")]
        depends_on_step_ids: Vec<StepId>,
    },
}

/// 补丁控制器给出的动作
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    #[default]
    Continue,
    Patch,
    Complete,
}

/// 补丁决策：固定形状，形状之外的自由文本不被接受
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchDecision {
    #[serde(default)]
    pub action: PatchAction,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub operations: Vec<PatchOperation>,
}

impl PatchDecision {
    pub fn continue_with(reason: impl Into<String>) -> Self {
        Self {
            action: PatchAction::Continue,
            is_complete: false,
            reason: reason.into(),
            operations: Vec::new(),
        }
    }

    /// isComplete 为真时视为 complete；patch 但没有操作时视为 continue
    pub fn effective_action(&self) -> PatchAction {
        if self.is_complete {
            return PatchAction::Complete;
        }
        match self.action {
            PatchAction::Patch if self.operations.is_empty() => PatchAction::Continue,
            other => other,
        }
    }
}

/// 把操作依次应用到步骤列表的副本上。
///
/// `executed` 是已执行（不可变）前缀的长度：位置 `< executed` 的步骤不能被删除、修改或改依赖，
/// 插入位置也必须 `>= executed`。成功时返回重新编号并校验过的新列表。
pub fn apply_patch(
    steps: &[Step],
    executed: usize,
    operations: &[PatchOperation],
) -> Result<Vec<Step>, PlanError> {
    let mut next: Vec<Step> = steps.to_vec();

    for op in operations {
        match op {
            PatchOperation::Insert { at, step } => {
                if *at < executed {
                    return Err(PlanError::ImmutableStep { index: *at });
                }
                if *at > next.len() {
                    return Err(PlanError::InvalidOperation(format!(
                        "insert position {at} is past the end of the plan ({})",
                        next.len()
                    )));
                }
                next.insert(*at, step.clone());
                // 先补 id，后续操作才能按 stepId 找到新步骤
                normalize_steps(&mut next[*at..=*at]);
            }
            PatchOperation::Remove { step_id } => {
                let i = mutable_index(&next, executed, step_id)?;
                next.remove(i);
            }
            PatchOperation::Modify {
                step_id,
                tool_name,
                reason,
                draft_args,
                skip,
            } => {
                let i = mutable_index(&next, executed, step_id)?;
                let step = &mut next[i];
                if let Some(name) = tool_name {
                    step.tool_name = name.clone();
                }
                if let Some(reason) = reason {
                    step.reason = reason.clone();
                }
                if let Some(args) = draft_args {
                    step.draft_args = args.clone();
                }
                if let Some(skip) = skip {
                    step.skip = *skip;
                }
            }
            PatchOperation::SetDependencies {
                step_id,
                depends_on_step_ids,
            } => {
                let i = mutable_index(&next, executed, step_id)?;
                next[i].depends_on_step_ids = depends_on_step_ids.clone();
            }
        }
    }

    normalize_steps(&mut next);
    crate::plan::graph::validate(&next)?;
    Ok(next)
}

fn mutable_index(steps: &[Step], executed: usize, step_id: &str) -> Result<usize, PlanError> {
    let i = steps
        .iter()
        .position(|s| s.step_id == step_id)
        .ok_or_else(|| PlanError::StepNotFound(step_id.to_string()))?;
    if i < executed {
        return Err(PlanError::ImmutableStep { index: i });
    }
    Ok(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Vec<Step> {
        let mut steps = vec![
            Step::new("a", "echo"),
            Step::new("b", "echo").depends_on(["a"]),
            Step::new("c", "echo"),
        ];
        normalize_steps(&mut steps);
        steps
    }

    #[test]
    fn test_decision_parses_fixed_shape() {
        let d: PatchDecision = serde_json::from_value(serde_json::json!({
            "action": "patch",
            "reason": "need an extra lookup",
            "operations": [
                {"op": "insert", "at": 2, "step": {"stepId": "x", "toolName": "echo", "dependsOnStepIds": ["a"]}},
                {"op": "modify", "stepId": "c", "skip": true}
            ]
        }))
        .unwrap();
        assert_eq!(d.effective_action(), PatchAction::Patch);
        assert_eq!(d.operations.len(), 2);
    }

    #[test]
    fn test_is_complete_overrides_action() {
        let d = PatchDecision {
            is_complete: true,
            ..PatchDecision::continue_with("done")
        };
        assert_eq!(d.effective_action(), PatchAction::Complete);
    }

    #[test]
    fn test_insert_and_modify_suffix() {
        let ops = vec![
            PatchOperation::Insert {
                at: 2,
                step: Step::new("x", "echo").depends_on(["b"]),
            },
            PatchOperation::Modify {
                step_id: "c".into(),
                tool_name: None,
                reason: Some(vec!["updated".into()]),
                draft_args: None,
                skip: Some(true),
            },
        ];
        let next = apply_patch(&plan(), 2, &ops).unwrap();
        let ids: Vec<_> = next.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "x", "c"]);
        assert_eq!(next[3].display_index, 4);
        assert!(next[3].skip);
    }

    #[test]
    fn test_targeting_executed_prefix_is_rejected() {
        let original = plan();
        let remove = vec![PatchOperation::Remove { step_id: "b".into() }];
        assert_eq!(
            apply_patch(&original, 2, &remove),
            Err(PlanError::ImmutableStep { index: 1 })
        );
        let insert = vec![PatchOperation::Insert {
            at: 1,
            step: Step::new("y", "echo"),
        }];
        assert_eq!(
            apply_patch(&original, 2, &insert),
            Err(PlanError::ImmutableStep { index: 1 })
        );
        assert_eq!(original, plan());
    }

    #[test]
    fn test_patch_breaking_dependencies_is_rejected_whole() {
        let ops = vec![
            PatchOperation::Modify {
                step_id: "c".into(),
                tool_name: Some("other".into()),
                reason: None,
                draft_args: None,
                skip: None,
            },
            PatchOperation::SetDependencies {
                step_id: "c".into(),
                depends_on_step_ids: vec!["zzz".into()],
            },
        ];
        assert!(matches!(
            apply_patch(&plan(), 1, &ops),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_inserted_step_without_id_gets_one() {
        let ops = vec![PatchOperation::Insert {
            at: 3,
            step: Step::new("", "echo"),
        }];
        let next = apply_patch(&plan(), 1, &ops).unwrap();
        assert!(next[3].step_id.starts_with("s_"));
    }
}
