//! 运行历史存储
//!
//! 每个 run 一条只追加的事件流。append 永不向调用方报错（失败只记日志，历史丢失不能中断运行）；
//! list 按追加顺序返回；latest_by_step_id / latest_by_index 顺序扫描、后写覆盖先写，
//! 因此同一步骤的多次 tool_result 中只有最后追加的那条生效。
//!
//! 两种后端：MemoryHistoryStore（进程内）与 JsonlHistoryStore（每个 run 一个 `<run_id>.jsonl` 文件，
//! 读请求由内存索引服务，load_run 从文件回放）。run 结束后引擎调用 close_run 释放文件句柄。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::plan::patch::PatchOperation;
use crate::plan::types::{Plan, RunId};

/// 历史事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    ToolResult,
    ToolError,
    ArggenError,
    RetryBegin,
    RetryDone,
    PlanPatch,
}

/// 一条历史事件；写入后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub run_id: RunId,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<PatchOperation>>,
    pub timestamp: i64,
}

impl HistoryEntry {
    fn base(run_id: &str, kind: HistoryKind) -> Self {
        Self {
            run_id: run_id.to_string(),
            kind,
            step_id: None,
            planned_step_index: None,
            tool_name: None,
            args: None,
            result: None,
            error: None,
            attempt: None,
            success: None,
            reason: None,
            operations: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn at_step(mut self, step_id: &str, index: usize, tool_name: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self.planned_step_index = Some(index);
        self.tool_name = Some(tool_name.to_string());
        self
    }

    pub fn tool_result(
        run_id: &str,
        step_id: &str,
        index: usize,
        tool_name: &str,
        args: Value,
        result: Value,
    ) -> Self {
        let mut e = Self::base(run_id, HistoryKind::ToolResult).at_step(step_id, index, tool_name);
        e.args = Some(args);
        e.result = Some(result);
        e.success = Some(true);
        e
    }

    pub fn tool_error(
        run_id: &str,
        step_id: &str,
        index: usize,
        tool_name: &str,
        args: Value,
        error: impl Into<String>,
        attempt: usize,
    ) -> Self {
        let mut e = Self::base(run_id, HistoryKind::ToolError).at_step(step_id, index, tool_name);
        e.args = Some(args);
        e.error = Some(error.into());
        e.attempt = Some(attempt);
        e.success = Some(false);
        e
    }

    pub fn arggen_error(
        run_id: &str,
        step_id: &str,
        index: usize,
        tool_name: &str,
        error: impl Into<String>,
        attempt: usize,
    ) -> Self {
        let mut e = Self::base(run_id, HistoryKind::ArggenError).at_step(step_id, index, tool_name);
        e.error = Some(error.into());
        e.attempt = Some(attempt);
        e
    }

    pub fn retry_begin(run_id: &str, step_id: &str, index: usize, tool_name: &str, attempt: usize) -> Self {
        let mut e = Self::base(run_id, HistoryKind::RetryBegin).at_step(step_id, index, tool_name);
        e.attempt = Some(attempt);
        e
    }

    pub fn retry_done(
        run_id: &str,
        step_id: &str,
        index: usize,
        tool_name: &str,
        attempts: usize,
        success: bool,
    ) -> Self {
        let mut e = Self::base(run_id, HistoryKind::RetryDone).at_step(step_id, index, tool_name);
        e.attempt = Some(attempts);
        e.success = Some(success);
        e
    }

    pub fn plan_patch(
        run_id: &str,
        at_index: usize,
        reason: impl Into<String>,
        operations: Vec<PatchOperation>,
        applied: bool,
    ) -> Self {
        let mut e = Self::base(run_id, HistoryKind::PlanPatch);
        e.planned_step_index = Some(at_index);
        e.reason = Some(reason.into());
        e.operations = Some(operations);
        e.success = Some(applied);
        e
    }

    /// 渲染用的结果载荷：结果信封里有 data 就取 data，否则取整个结果
    pub fn result_payload(&self) -> Option<&Value> {
        self.result
            .as_ref()
            .map(|r| r.get("data").filter(|d| !d.is_null()).unwrap_or(r))
    }
}

/// 后写覆盖先写：每个 stepId 最新的 tool_result
pub fn latest_results_by_step_id(entries: &[HistoryEntry]) -> HashMap<String, HistoryEntry> {
    let mut out = HashMap::new();
    for e in entries.iter().filter(|e| e.kind == HistoryKind::ToolResult) {
        if let Some(sid) = e.step_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            out.insert(sid.to_string(), e.clone());
        }
    }
    out
}

/// 后写覆盖先写：每个计划位置最新的 tool_result
pub fn latest_results_by_index(entries: &[HistoryEntry]) -> BTreeMap<usize, HistoryEntry> {
    let mut out = BTreeMap::new();
    for e in entries.iter().filter(|e| e.kind == HistoryKind::ToolResult) {
        if let Some(idx) = e.planned_step_index {
            out.insert(idx, e.clone());
        }
    }
    out
}

/// 历史存储契约
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// 追加事件；失败只记日志
    async fn append(&self, entry: HistoryEntry);

    /// 按追加顺序返回 `[from, to)`；`to` 为 None 表示到末尾
    async fn list(&self, run_id: &str, from: usize, to: Option<usize>) -> Vec<HistoryEntry>;

    /// 保存 run 当前的计划快照
    async fn save_plan(&self, run_id: &str, plan: &Plan);

    async fn get_plan(&self, run_id: &str) -> Option<Plan>;

    /// run 结束：释放该 run 占用的资源，已写入的历史仍可读取
    async fn close_run(&self, _run_id: &str) {}

    async fn latest_by_step_id(&self, run_id: &str) -> HashMap<String, HistoryEntry> {
        latest_results_by_step_id(&self.list(run_id, 0, None).await)
    }

    async fn latest_by_index(&self, run_id: &str) -> BTreeMap<usize, HistoryEntry> {
        latest_results_by_index(&self.list(run_id, 0, None).await)
    }
}

#[derive(Default)]
struct RunLog {
    entries: Vec<HistoryEntry>,
    plan: Option<Plan>,
}

/// 进程内历史存储
#[derive(Default)]
pub struct MemoryHistoryStore {
    runs: RwLock<HashMap<RunId, RunLog>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_ids(&self) -> Vec<RunId> {
        self.runs.read().await.keys().cloned().collect()
    }

    /// 丢弃某个 run 的全部历史
    pub async fn remove_run(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) {
        let mut runs = self.runs.write().await;
        runs.entry(entry.run_id.clone()).or_default().entries.push(entry);
    }

    async fn list(&self, run_id: &str, from: usize, to: Option<usize>) -> Vec<HistoryEntry> {
        let runs = self.runs.read().await;
        let Some(log) = runs.get(run_id) else {
            return Vec::new();
        };
        let len = log.entries.len();
        let end = to.map(|t| t.min(len)).unwrap_or(len);
        if from >= end {
            return Vec::new();
        }
        log.entries[from..end].to_vec()
    }

    async fn save_plan(&self, run_id: &str, plan: &Plan) {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string()).or_default().plan = Some(plan.clone());
    }

    async fn get_plan(&self, run_id: &str) -> Option<Plan> {
        self.runs.read().await.get(run_id).and_then(|l| l.plan.clone())
    }
}

/// JSONL 文件历史存储：`<dir>/<run_id>.jsonl` 存事件，`<dir>/<run_id>.plan.json` 存计划快照
pub struct JsonlHistoryStore {
    dir: PathBuf,
    index: MemoryHistoryStore,
    files: Mutex<HashMap<RunId, Arc<Mutex<tokio::fs::File>>>>,
}

impl JsonlHistoryStore {
    pub async fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            index: MemoryHistoryStore::new(),
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize(run_id)))
    }

    fn plan_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.plan.json", sanitize(run_id)))
    }

    /// 从文件回放某个 run 的历史与计划到内存索引；返回回放的事件数。坏行跳过并记日志
    pub async fn load_run(&self, run_id: &str) -> std::io::Result<usize> {
        let text = match tokio::fs::read_to_string(self.log_path(run_id)).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        self.index.remove_run(run_id).await;
        let mut loaded = 0;
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => {
                    self.index.append(entry).await;
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run_id, line = lineno + 1, error = %e, "skip malformed history line");
                }
            }
        }
        if let Ok(raw) = tokio::fs::read_to_string(self.plan_path(run_id)).await {
            match serde_json::from_str::<Plan>(&raw) {
                Ok(plan) => self.index.save_plan(run_id, &plan).await,
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "skip malformed plan snapshot"),
            }
        }
        Ok(loaded)
    }

    /// 当前打开的 run 日志文件数
    pub async fn open_files(&self) -> usize {
        self.files.lock().await.len()
    }

    /// 取出（必要时打开）某个 run 的日志句柄；表锁只在查找期间持有
    async fn handle(&self, run_id: &str) -> std::io::Result<Arc<Mutex<tokio::fs::File>>> {
        let mut files = self.files.lock().await;
        if let Some(file) = files.get(run_id) {
            return Ok(Arc::clone(file));
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(run_id))
            .await?;
        let file = Arc::new(Mutex::new(file));
        files.insert(run_id.to_string(), Arc::clone(&file));
        Ok(file)
    }

    async fn write_line(&self, run_id: &str, mut line: String) -> std::io::Result<()> {
        line.push('\n');
        let file = self.handle(run_id).await?;
        let mut file = file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

fn sanitize(run_id: &str) -> String {
    run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, entry: HistoryEntry) {
        let run_id = entry.run_id.clone();
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = self.write_line(&run_id, line).await {
                    tracing::warn!(run_id = %run_id, error = %e, "history append to file failed");
                }
            }
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "history entry not serializable"),
        }
        self.index.append(entry).await;
    }

    async fn list(&self, run_id: &str, from: usize, to: Option<usize>) -> Vec<HistoryEntry> {
        self.index.list(run_id, from, to).await
    }

    async fn save_plan(&self, run_id: &str, plan: &Plan) {
        self.index.save_plan(run_id, plan).await;
        let result = match serde_json::to_vec_pretty(plan) {
            Ok(bytes) => tokio::fs::write(self.plan_path(run_id), bytes).await,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };
        if let Err(e) = result {
            tracing::warn!(run_id = %run_id, error = %e, "plan snapshot write failed");
        }
    }

    async fn get_plan(&self, run_id: &str) -> Option<Plan> {
        self.index.get_plan(run_id).await
    }

    async fn close_run(&self, run_id: &str) {
        let file = self.files.lock().await.remove(run_id);
        if let Some(file) = file {
            if let Err(e) = file.lock().await.sync_all().await {
                tracing::warn!(run_id = %run_id, error = %e, "history sync on close failed");
            }
            tracing::debug!(run_id = %run_id, "history file closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::Step;
    use serde_json::json;

    #[tokio::test]
    async fn test_latest_result_wins() {
        let store = MemoryHistoryStore::new();
        store
            .append(HistoryEntry::tool_result("r", "a", 0, "echo", json!({}), json!({"v": 1})))
            .await;
        store
            .append(HistoryEntry::tool_error("r", "a", 0, "echo", json!({}), "boom", 1))
            .await;
        store
            .append(HistoryEntry::tool_result("r", "a", 0, "echo", json!({}), json!({"v": 2})))
            .await;

        let by_id = store.latest_by_step_id("r").await;
        assert_eq!(by_id["a"].result, Some(json!({"v": 2})));
        let by_idx = store.latest_by_index("r").await;
        assert_eq!(by_idx[&0].result, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_list_range_is_append_ordered() {
        let store = MemoryHistoryStore::new();
        for i in 0..4 {
            store
                .append(HistoryEntry::retry_begin("r", "a", 0, "echo", i))
                .await;
        }
        let mid = store.list("r", 1, Some(3)).await;
        assert_eq!(mid.iter().map(|e| e.attempt).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        assert!(store.list("r", 5, None).await.is_empty());
        assert!(store.list("missing", 0, None).await.is_empty());
    }

    #[test]
    fn test_entry_serializes_type_field() {
        let e = HistoryEntry::retry_done("r", "a", 0, "echo", 2, true);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "retry_done");
        assert_eq!(v["plannedStepIndex"], 0);
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_result_payload_prefers_data() {
        let e = HistoryEntry::tool_result(
            "r",
            "a",
            0,
            "echo",
            json!({}),
            json!({"success": true, "data": {"text": "hi"}}),
        );
        assert_eq!(e.result_payload(), Some(&json!({"text": "hi"})));
    }

    fn two_step_plan() -> Plan {
        let mut fetch = Step::new("fetch", "echo");
        fetch.draft_args = json!({"text": "a"});
        let mut store = Step::new("store", "echo");
        store.depends_on_step_ids = vec!["fetch".to_string()];
        Plan::new(vec![fetch, store])
    }

    #[tokio::test]
    async fn test_jsonl_reopen_replays_history_and_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = two_step_plan();
        {
            let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
            store
                .append(HistoryEntry::tool_result("run-1", "fetch", 0, "echo", json!({}), json!({"v": 1})))
                .await;
            store
                .append(HistoryEntry::tool_error("run-1", "fetch", 0, "echo", json!({}), "boom", 1))
                .await;
            store
                .append(HistoryEntry::tool_result("run-1", "fetch", 0, "echo", json!({}), json!({"v": 2})))
                .await;
            store.save_plan("run-1", &plan).await;
            assert_eq!(store.open_files().await, 1);
            store.close_run("run-1").await;
            assert_eq!(store.open_files().await, 0);
        }
        assert!(dir.path().join("run-1.jsonl").exists());
        assert!(dir.path().join("run-1.plan.json").exists());

        let reopened = JsonlHistoryStore::open(dir.path()).await.unwrap();
        assert!(reopened.list("run-1", 0, None).await.is_empty());
        assert_eq!(reopened.load_run("run-1").await.unwrap(), 3);

        let entries = reopened.list("run-1", 0, None).await;
        assert_eq!(
            entries.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![HistoryKind::ToolResult, HistoryKind::ToolError, HistoryKind::ToolResult]
        );
        assert_eq!(
            reopened.latest_by_step_id("run-1").await["fetch"].result,
            Some(json!({"v": 2}))
        );
        assert_eq!(reopened.latest_by_index("run-1").await[&0].result, Some(json!({"v": 2})));
        assert_eq!(reopened.get_plan("run-1").await, Some(plan));
    }

    #[tokio::test]
    async fn test_jsonl_append_after_close_reopens_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        store
            .append(HistoryEntry::retry_begin("run/2", "a", 0, "echo", 1))
            .await;
        store.close_run("run/2").await;
        store.close_run("run/2").await;
        store
            .append(HistoryEntry::retry_done("run/2", "a", 0, "echo", 1, true))
            .await;
        store.close_run("run/2").await;
        assert_eq!(store.open_files().await, 0);

        std::fs::write(
            dir.path().join("run_2.jsonl"),
            format!(
                "{}\nnot json\n{}\n",
                serde_json::to_string(&HistoryEntry::retry_begin("run/2", "a", 0, "echo", 1)).unwrap(),
                serde_json::to_string(&HistoryEntry::retry_done("run/2", "a", 0, "echo", 1, true)).unwrap(),
            ),
        )
        .unwrap();
        let reopened = JsonlHistoryStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_run("run/2").await.unwrap(), 2);
        assert!(reopened.get_plan("run/2").await.is_none());
    }

    #[tokio::test]
    async fn test_jsonl_runs_write_to_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonlHistoryStore::open(dir.path()).await.unwrap());
        let mut writers = Vec::new();
        for run in ["left", "right"] {
            let store = Arc::clone(&store);
            writers.push(tokio::spawn(async move {
                for i in 0..20 {
                    store
                        .append(HistoryEntry::retry_begin(run, "a", 0, "echo", i))
                        .await;
                }
                store.close_run(run).await;
            }));
        }
        for w in writers {
            w.await.unwrap();
        }
        assert_eq!(store.open_files().await, 0);

        for run in ["left", "right"] {
            let text = std::fs::read_to_string(dir.path().join(format!("{run}.jsonl"))).unwrap();
            let attempts: Vec<usize> = text
                .lines()
                .map(|l| serde_json::from_str::<HistoryEntry>(l).unwrap().attempt.unwrap())
                .collect();
            assert_eq!(attempts, (0..20).collect::<Vec<_>>());
        }
    }
}
