//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RUNNER__MAX_ATTEMPTS=5`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub runner: RunnerSection,
    pub server: ServerSection,
    /// 外部工具提供方定义（[[providers]]）
    pub providers: Vec<ProviderDefinition>,
}

/// [app] 段：应用名、运行历史目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 设置后每个 run 的历史以 JSONL 追加写入该目录；未设置时仅保存在内存
    pub history_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// 无依赖声明的步骤如何取上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFallback {
    /// 回退到全部之前步骤（默认的顺序智能体行为）
    #[default]
    AllPrior,
    /// 不回退：未声明依赖即看不到任何之前结果
    None,
}

/// [runner] 段：重试、超时、计划修补触发点、依赖回退策略、并行度
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// 每步最多尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub enable_plan_patch: bool,
    #[serde(default = "default_patch_timeout_secs")]
    pub patch_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub patch_after_step: bool,
    #[serde(default = "default_true")]
    pub patch_after_retry: bool,
    #[serde(default = "default_true")]
    pub patch_on_failure: bool,
    /// 每执行 N 步额外咨询一次（周期触发）
    pub patch_every_n_steps: Option<usize>,
    /// 传给补丁控制器的最近历史条数
    #[serde(default = "default_recent_history_window")]
    pub recent_history_window: usize,
    #[serde(default)]
    pub dependency_fallback: DependencyFallback,
    /// 同一批次最多并发执行的步骤数
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// 由模型根据依赖上下文生成参数；关闭时直接使用计划里的 draftArgs
    #[serde(default)]
    pub llm_arguments: bool,
}

fn default_max_attempts() -> usize {
    3
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_patch_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_recent_history_window() -> usize {
    12
}

fn default_max_parallel() -> usize {
    1
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            tool_timeout_secs: default_tool_timeout_secs(),
            enable_plan_patch: false,
            patch_timeout_secs: default_patch_timeout_secs(),
            patch_after_step: true,
            patch_after_retry: true,
            patch_on_failure: true,
            patch_every_n_steps: None,
            recent_history_window: default_recent_history_window(),
            dependency_fallback: DependencyFallback::AllPrior,
            max_parallel: default_max_parallel(),
            llm_arguments: false,
        }
    }
}

/// 传输类型：子进程管道 / 套接字 / 会话复用 HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[serde(alias = "stdio")]
    Pipe,
    #[serde(alias = "websocket", alias = "ws")]
    Socket,
    #[serde(alias = "streamable_http")]
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Pipe => write!(f, "pipe"),
            TransportKind::Socket => write!(f, "socket"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// [server] 段：暴露本地工具注册表的传输与会话回收策略
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_server_path")]
    pub path: String,
    /// HTTP 会话空闲多久后回收（秒）
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// 同时存在的 HTTP 会话上限
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_server_transport() -> TransportKind {
    TransportKind::Http
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_server_path() -> String {
    "/mcp".to_string()
}

fn default_session_idle_secs() -> u64 {
    1800
}

fn default_max_sessions() -> usize {
    256
}

fn default_reap_interval_secs() -> u64 {
    60
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            transport: default_server_transport(),
            bind_addr: default_bind_addr(),
            path: default_server_path(),
            session_idle_secs: default_session_idle_secs(),
            max_sessions: default_max_sessions(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// [[providers]] 条目：外部工具提供方定义
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    /// pipe：可执行程序
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// socket / http：端点地址
    pub url: Option<String>,
    /// http：额外请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    30
}

impl ProviderDefinition {
    pub fn pipe(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: TransportKind::Pipe,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }

    pub fn remote(id: impl Into<String>, kind: TransportKind, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 校验定义是否完整（缺 id、pipe 缺 command、socket/http 缺 url 均为配置错误）
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("provider definition missing id".to_string());
        }
        if self.timeout_secs == 0 {
            return Err(format!("provider {} has timeout_secs=0", self.id));
        }
        match self.kind {
            TransportKind::Pipe => {
                if self.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!("provider {} pipe transport requires command", self.id));
                }
            }
            TransportKind::Socket | TransportKind::Http => {
                if self.url.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!(
                        "provider {} {} transport requires url",
                        self.id, self.kind
                    ));
                }
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_defaults() {
        let runner = RunnerSection::default();
        assert_eq!(runner.max_attempts, 3);
        assert!(!runner.enable_plan_patch);
        assert_eq!(runner.dependency_fallback, DependencyFallback::AllPrior);
        assert_eq!(runner.max_parallel, 1);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[runner]
max_attempts = 5
enable_plan_patch = true
dependency_fallback = "none"

[server]
transport = "socket"

[[providers]]
id = "fs"
type = "stdio"
command = "fs-server"
args = ["--root", "/tmp"]

[[providers]]
id = "remote"
type = "streamable_http"
url = "http://127.0.0.1:9000/mcp"
"#,
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.runner.max_attempts, 5);
        assert!(config.runner.enable_plan_patch);
        assert_eq!(config.runner.dependency_fallback, DependencyFallback::None);
        assert_eq!(config.server.transport, TransportKind::Socket);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].kind, TransportKind::Pipe);
        assert_eq!(config.providers[1].kind, TransportKind::Http);
        assert!(config.providers.iter().all(|p| p.validate().is_ok()));
    }

    #[test]
    fn test_provider_validation() {
        let mut def = ProviderDefinition::pipe("a", "", Vec::new());
        assert!(def.validate().is_err());
        def.command = Some("node".to_string());
        assert!(def.validate().is_ok());

        let remote = ProviderDefinition {
            url: None,
            ..ProviderDefinition::remote("b", TransportKind::Socket, "ws://x")
        };
        assert!(remote.validate().is_err());

        let unnamed = ProviderDefinition::remote(" ", TransportKind::Http, "http://x");
        assert!(unnamed.validate().is_err());
    }
}
