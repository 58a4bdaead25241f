//! 依赖上下文构建
//!
//! 给定 run 中的目标步骤位置 i，计算参数 / 决策生成时允许看到的前序步骤：
//! 声明了依赖且闭包非空时，只看依赖闭包；没有声明依赖时按 DependencyFallback 策略
//! （默认 AllPrior：所有 < i 的步骤）。重试时可把 i 自身加入，以便看到它最近一次失败。
//! 每个允许的位置只取最新的 tool_result，按计划顺序渲染成 user / assistant 一问一答。
//!
//! 同一次构建只读取一次历史与计划快照，并发写入不会让结果出现半截状态。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::DependencyFallback;
use crate::llm::Message;
use crate::plan::graph::dependency_closure;
use crate::plan::history::{latest_results_by_step_id, HistoryEntry, HistoryKind, HistoryStore};
use crate::plan::types::{Plan, Step};

/// 单个参数 / 结果预览的最大字符数
pub const DEFAULT_CLIP_CHARS: usize = 4000;

/// 上下文中的一项：某个计划位置最新的结果（或重试时目标步骤自身最近一次失败）
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    pub index: usize,
    pub step_id: String,
    pub tool_name: String,
    pub reason: String,
    pub args: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ContextItem {
    fn from_entry(entry: &HistoryEntry, index: usize, plan: &Plan) -> Self {
        let step = plan.get(index);
        Self {
            index,
            step_id: entry
                .step_id
                .clone()
                .or_else(|| step.map(|s| s.step_id.clone()))
                .unwrap_or_default(),
            tool_name: entry
                .tool_name
                .clone()
                .or_else(|| step.map(|s| s.tool_name.clone()))
                .unwrap_or_default(),
            reason: step.map(Step::reason_text).unwrap_or_default(),
            args: entry.args.clone().unwrap_or(Value::Null),
            result: entry.result_payload().cloned(),
            error: entry.error.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// 计算目标位置允许看到的计划位置（升序）
pub fn allowed_indices(
    plan: &Plan,
    index: usize,
    include_current: bool,
    fallback: DependencyFallback,
) -> BTreeSet<usize> {
    let chain = dependency_closure(&plan.steps, index);
    let mut allowed = if !chain.is_empty() {
        chain
    } else {
        match fallback {
            DependencyFallback::AllPrior => (0..index.min(plan.len())).collect(),
            DependencyFallback::None => BTreeSet::new(),
        }
    };
    if include_current {
        allowed.insert(index);
    }
    allowed
}

/// 依赖上下文构建器
#[derive(Clone)]
pub struct ContextBuilder {
    store: Arc<dyn HistoryStore>,
    fallback: DependencyFallback,
    clip_chars: usize,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            fallback: DependencyFallback::default(),
            clip_chars: DEFAULT_CLIP_CHARS,
        }
    }

    pub fn with_fallback(mut self, fallback: DependencyFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_clip_chars(mut self, clip_chars: usize) -> Self {
        self.clip_chars = clip_chars;
        self
    }

    pub fn fallback(&self) -> DependencyFallback {
        self.fallback
    }

    /// 构建目标位置的上下文项（计划顺序）
    pub async fn build(&self, run_id: &str, index: usize, include_current: bool) -> Vec<ContextItem> {
        let Some(plan) = self.store.get_plan(run_id).await else {
            return Vec::new();
        };
        let history = self.store.list(run_id, 0, None).await;
        build_items(&plan, &history, index, include_current, self.fallback)
    }

    /// 构建并渲染为对话消息
    pub async fn messages(&self, run_id: &str, index: usize, include_current: bool) -> Vec<Message> {
        let items = self.build(run_id, index, include_current).await;
        render_messages(&items, self.clip_chars)
    }

    /// 把显式给出的上游步骤的最新结果整理为一条「依赖结果(JSON)」消息；没有任何结果时返回 None
    pub async fn dependent_results(&self, run_id: &str, step_ids: &[String]) -> Option<Message> {
        let mut seen = BTreeSet::new();
        let ids: Vec<&str> = step_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && seen.insert(*s))
            .collect();
        if ids.is_empty() {
            return None;
        }
        let history = self.store.list(run_id, 0, None).await;
        let plan = self.store.get_plan(run_id).await.unwrap_or_default();
        let latest = latest_results_by_step_id(&history);

        let items: Vec<Value> = ids
            .iter()
            .filter_map(|sid| latest.get(*sid))
            .map(|h| {
                let reason = h
                    .planned_step_index
                    .and_then(|i| plan.get(i))
                    .map(Step::reason_text)
                    .unwrap_or_default();
                serde_json::json!({
                    "stepId": h.step_id,
                    "plannedStepIndex": h.planned_step_index,
                    "toolName": h.tool_name,
                    "reason": clip(&reason, self.clip_chars),
                    "argsPreview": clip_json(h.args.as_ref(), self.clip_chars),
                    "resultPreview": clip_json(h.result_payload(), self.clip_chars),
                })
            })
            .collect();
        if items.is_empty() {
            return None;
        }
        let body = serde_json::to_string_pretty(&items).unwrap_or_default();
        Some(Message::assistant(format!("依赖结果(JSON):\n{body}")))
    }
}

/// 纯函数版本：给定计划与历史快照构建上下文项
pub fn build_items(
    plan: &Plan,
    history: &[HistoryEntry],
    index: usize,
    include_current: bool,
    fallback: DependencyFallback,
) -> Vec<ContextItem> {
    let allowed = allowed_indices(plan, index, include_current, fallback);

    let mut latest = std::collections::BTreeMap::new();
    for e in history {
        let Some(idx) = e.planned_step_index else {
            continue;
        };
        if !allowed.contains(&idx) {
            continue;
        }
        let counts = match e.kind {
            HistoryKind::ToolResult => true,
            // 只有目标位置自身在重试模式下才会浮现最近一次失败
            HistoryKind::ToolError => include_current && idx == index,
            _ => false,
        };
        if counts {
            latest.insert(idx, e);
        }
    }

    latest
        .into_iter()
        .map(|(idx, e)| ContextItem::from_entry(e, idx, plan))
        .collect()
}

/// 每项渲染为一问一答：user 说明该用哪个工具与理由，assistant 给出参数与结果（或错误）
pub fn render_messages(items: &[ContextItem], clip_chars: usize) -> Vec<Message> {
    let mut out = Vec::with_capacity(items.len() * 2);
    for item in items {
        let reason = if item.reason.is_empty() {
            "(未提供)"
        } else {
            item.reason.as_str()
        };
        out.push(Message::user(format!(
            "现在该使用 {} 了。原因: {}",
            item.tool_name, reason
        )));
        let args = clip_json(Some(&item.args), clip_chars);
        let tail = match &item.error {
            Some(err) => format!("错误: {}", clip(err, clip_chars)),
            None => format!("结果(JSON): {}", clip_json(item.result.as_ref(), clip_chars)),
        };
        out.push(Message::assistant(format!("参数(JSON): {args}\n{tail}")));
    }
    out
}

/// 按字符截断
pub fn clip(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut s: String = text.chars().take(max_chars).collect();
    s.push('…');
    s
}

fn clip_json(value: Option<&Value>, max_chars: usize) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(v) => clip(&v.to_string(), max_chars),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::history::MemoryHistoryStore;
    use crate::plan::types::Step;
    use serde_json::json;

    fn plan_abc() -> Plan {
        Plan::new(vec![
            Step::new("a", "search").with_reason("find"),
            Step::new("b", "fetch").depends_on(["a"]),
            Step::new("c", "summarize"),
        ])
        .prepared()
        .unwrap()
    }

    #[test]
    fn test_allowed_indices_closure_or_fallback() {
        let plan = plan_abc();
        let b = allowed_indices(&plan, 1, false, DependencyFallback::AllPrior);
        assert_eq!(b.into_iter().collect::<Vec<_>>(), vec![0]);
        let c = allowed_indices(&plan, 2, false, DependencyFallback::AllPrior);
        assert_eq!(c.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(allowed_indices(&plan, 2, false, DependencyFallback::None).is_empty());
        let retry = allowed_indices(&plan, 1, true, DependencyFallback::AllPrior);
        assert_eq!(retry.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_retry_mode_surfaces_own_failure() {
        let store = Arc::new(MemoryHistoryStore::new());
        store.save_plan("r", &plan_abc()).await;
        store
            .append(HistoryEntry::tool_result("r", "a", 0, "search", json!({"q": 1}), json!({"hits": 3})))
            .await;
        store
            .append(HistoryEntry::tool_error("r", "b", 1, "fetch", json!({"u": 1}), "503", 1))
            .await;

        let builder = ContextBuilder::new(store.clone());
        let plain = builder.build("r", 1, false).await;
        assert_eq!(plain.len(), 1);

        let retry = builder.build("r", 1, true).await;
        assert_eq!(retry.len(), 2);
        assert_eq!(retry[1].error.as_deref(), Some("503"));

        let msgs = render_messages(&retry, 100);
        assert_eq!(msgs[0].content, "现在该使用 search 了。原因: find");
        assert!(msgs[3].content.ends_with("错误: 503"));
    }

    #[tokio::test]
    async fn test_dependent_results_block() {
        let store = Arc::new(MemoryHistoryStore::new());
        store.save_plan("r", &plan_abc()).await;
        store
            .append(HistoryEntry::tool_result("r", "a", 0, "search", json!({}), json!({"data": "old"})))
            .await;
        store
            .append(HistoryEntry::tool_result("r", "a", 0, "search", json!({}), json!({"data": "new"})))
            .await;

        let builder = ContextBuilder::new(store);
        let msg = builder
            .dependent_results("r", &["a".into(), "a".into(), "zzz".into()])
            .await
            .unwrap();
        assert!(msg.content.starts_with("依赖结果(JSON):"));
        assert!(msg.content.contains("new"));
        assert!(!msg.content.contains("old"));
        assert!(builder.dependent_results("r", &["zzz".into()]).await.is_none());
    }

    #[test]
    fn test_clip_counts_chars() {
        assert_eq!(clip("你好世界", 2), "你好…");
        assert_eq!(clip("abc", 0), "abc");
    }
}
