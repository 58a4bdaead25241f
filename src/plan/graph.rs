//! 计划依赖图
//!
//! 校验依赖不变式（唯一 id、只依赖更早的步骤、无环），计算依赖闭包，并为有界并行执行切分批次。
//! 闭包与环检测都用显式工作栈，畸形输入不会导致无界递归。

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use crate::plan::types::{PlanError, Step};

/// stepId -> 计划位置
pub fn index_map(steps: &[Step]) -> HashMap<&str, usize> {
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.step_id.as_str(), i))
        .collect()
}

/// 校验：id 唯一、依赖存在、非自依赖、无环、只指向更早的位置
pub fn validate(steps: &[Step]) -> Result<(), PlanError> {
    let mut ids: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if step.step_id.is_empty() {
            return Err(PlanError::InvalidOperation(format!(
                "step at index {i} has no stepId"
            )));
        }
        if step.tool_name.trim().is_empty() {
            return Err(PlanError::InvalidOperation(format!(
                "step {} has no toolName",
                step.step_id
            )));
        }
        if ids.insert(step.step_id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in steps {
        for dep in &step.depends_on_step_ids {
            if dep == &step.step_id {
                return Err(PlanError::SelfDependency(step.step_id.clone()));
            }
            if !ids.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step_id: step.step_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(at) = find_cycle(steps, &ids) {
        return Err(PlanError::CyclicDependency(steps[at].step_id.clone()));
    }

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on_step_ids {
            if ids.get(dep.as_str()).is_some_and(|&j| j >= i) {
                return Err(PlanError::ForwardDependency {
                    step_id: step.step_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// 三色 DFS（显式栈）；返回环上某个节点的位置
fn find_cycle(steps: &[Step], ids: &HashMap<&str, usize>) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color = vec![Color::White; steps.len()];

    for root in 0..steps.len() {
        if color[root] != Color::White {
            continue;
        }
        // (节点, 下一个要看的依赖下标)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let deps = &steps[node].depends_on_step_ids;
            if top.1 < deps.len() {
                let dep = &deps[top.1];
                top.1 += 1;
                let Some(&j) = ids.get(dep.as_str()) else {
                    continue;
                };
                match color[j] {
                    Color::Gray => return Some(j),
                    Color::White => {
                        color[j] = Color::Gray;
                        stack.push((j, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    None
}

/// 目标步骤 `target` 的依赖闭包：从其声明的依赖出发传递展开，只保留位置 < target 的步骤
pub fn dependency_closure(steps: &[Step], target: usize) -> BTreeSet<usize> {
    let mut chain = BTreeSet::new();
    let Some(step) = steps.get(target) else {
        return chain;
    };
    let ids = index_map(steps);
    let resolve = |sid: &String| ids.get(sid.trim()).copied().filter(|&j| j < target);

    let mut worklist: Vec<usize> = step.depends_on_step_ids.iter().filter_map(resolve).collect();
    while let Some(i) = worklist.pop() {
        if !chain.insert(i) {
            continue;
        }
        worklist.extend(steps[i].depends_on_step_ids.iter().filter_map(resolve));
    }
    chain
}

/// 从 `start` 起切分一个可并发执行的批次。
///
/// 第一步总是入批；之后的步骤必须声明了非空依赖（或 `empty_is_isolated` 为真），
/// 且其直接依赖都不在本批内，批大小不超过 `max`。
pub fn next_batch(steps: &[Step], start: usize, max: usize, empty_is_isolated: bool) -> Range<usize> {
    if start >= steps.len() {
        return start..start;
    }
    let mut end = start + 1;
    while end < steps.len() && end - start < max.max(1) {
        let step = &steps[end];
        if step.depends_on_step_ids.is_empty() && !empty_is_isolated {
            break;
        }
        let in_batch = steps[start..end]
            .iter()
            .any(|s| step.depends_on_step_ids.iter().any(|d| d == &s.step_id));
        if in_batch {
            break;
        }
        end += 1;
    }
    start..end
}
