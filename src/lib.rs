//! Hive - 依赖感知的计划执行引擎与工具调用协议层
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: JSON-RPC 工具协议（客户端传输、连接管理、工具服务端与 HTTP 会话）
//! - **observability**: tracing 初始化
//! - **plan**: 计划模型、运行历史、依赖上下文、补丁控制器与执行引擎
//! - **tools**: 本地工具注册表与调度器

pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod observability;
pub mod plan;
pub mod tools;
