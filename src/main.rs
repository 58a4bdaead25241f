//! Hive - 计划执行器
//!
//! 用法：`hive "<目标>" [plan.json]`
//!
//! 未给出计划文件时由模型根据目标与可用工具生成初始计划。
//! 配置来自 config/default.toml、`HIVE_CONFIG` 指向的文件与 `HIVE__*` 环境变量。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{ProviderCleanup, ShutdownCoordinator, ShutdownManager};
use hive::llm::create_llm_client;
use hive::mcp::ClientManager;
use hive::plan::{
    draft_plan, HistoryStore, JsonlHistoryStore, LlmArgumentGenerator, MemoryHistoryStore,
    PatchController, Plan, PlanEngine,
};
use hive::tools::{EchoTool, ToolDispatcher, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut args = std::env::args().skip(1);
    let objective = args
        .next()
        .context("usage: hive \"<objective>\" [plan.json]")?;
    let plan_path = args.next().map(PathBuf::from);

    let config_path = std::env::var("HIVE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);

    let clients = ClientManager::new();
    clients
        .connect_all(&cfg.providers)
        .await
        .context("Invalid provider configuration")?;
    let dispatcher = ToolDispatcher::new(Arc::new(registry), cfg.runner.tool_timeout_secs)
        .with_clients(clients.clone());

    let llm = create_llm_client(&cfg.llm);
    let llm_timeout = Duration::from_secs(cfg.llm.timeouts.request);

    let history: Arc<dyn HistoryStore> = match &cfg.app.history_dir {
        Some(dir) => Arc::new(
            JsonlHistoryStore::open(dir)
                .await
                .with_context(|| format!("Failed to open history dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryHistoryStore::new()),
    };

    let plan = match plan_path {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read plan {}", path.display()))?;
            serde_json::from_str::<Plan>(&text).context("Plan file is not a valid plan")?
        }
        None => draft_plan(
            llm.as_ref(),
            &objective,
            &dispatcher.descriptors().await,
            llm_timeout,
        )
        .await
        .context("Failed to draft plan")?,
    };

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!(target: "hive::events", "{line}");
            }
        }
    });

    let mut engine = PlanEngine::new(dispatcher, history, cfg.runner.clone())
        .with_patch_controller(PatchController::from_config(llm.clone(), &cfg.runner))
        .with_events(events_tx);
    if cfg.runner.llm_arguments {
        engine = engine.with_argument_generator(Arc::new(LlmArgumentGenerator::new(
            llm.clone(),
            llm_timeout,
        )));
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let outcome = tokio::select! {
        report = engine.run(&objective, plan) => Some(report),
        _ = shutdown.wait_for_shutdown() => None,
    };

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(ProviderCleanup::new(clients));
    coordinator.run_cleanup().await;

    let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "LLM token usage");

    match outcome {
        Some(report) => {
            let report = report.context("Run failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => tracing::warn!("Run interrupted before completion"),
    }
    Ok(())
}
