//! 计划执行引擎
//!
//! 每个 run 的状态机：Pending → Running → {Completed, Failed}，应用补丁时短暂进入 Patched 后立即回到 Running。
//! 按计划顺序逐步（或按有界并行批次）执行：跳过 skip 步骤 → 构建依赖上下文 → 生成参数 → 调度工具 →
//! 写 tool_result / tool_error；瞬时失败按 retry_begin / retry_done 记录并在上限内重试；
//! 在配置的触发点咨询补丁控制器，补丁只在两个批次之间应用。
//!
//! 每个 run 的计划与游标由独立的 Mutex 保护，补丁应用与游标推进互斥；执行步骤时使用计划快照，
//! 不会观察到应用了一半的补丁。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::{DependencyFallback, RunnerSection};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::plan::args::{ArgRequest, ArgumentGenerator, DraftArgsGenerator};
use crate::plan::context::ContextBuilder;
use crate::plan::controller::{PatchController, PatchInput};
use crate::plan::events::RunEvent;
use crate::plan::graph::next_batch;
use crate::plan::history::{HistoryEntry, HistoryKind, HistoryStore};
use crate::plan::patch::{apply_patch, PatchAction};
use crate::plan::types::{Plan, Run, RunId, RunStatus};
use crate::tools::{ToolDescriptor, ToolDispatcher, ToolOutcome};

/// 一次 run 结束后的汇总
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub objective: String,
    pub status: RunStatus,
    pub executed_steps: usize,
    pub patches_applied: usize,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 活跃 run 的只读快照
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run: Run,
    pub plan: Plan,
    /// 已执行（不可变）前缀的长度
    pub cursor: usize,
}

struct RunState {
    run: Run,
    plan: Plan,
    cursor: usize,
}

enum StepOutcome {
    Skipped,
    Succeeded { retried: bool },
    Failed { error: AgentError, retried: bool },
}

enum PatchVerdict {
    Continue,
    Applied,
    Complete,
}

#[derive(Default)]
struct Counters {
    executed: usize,
    patches: usize,
}

/// 计划执行引擎
pub struct PlanEngine {
    dispatcher: ToolDispatcher,
    history: Arc<dyn HistoryStore>,
    context: ContextBuilder,
    args: Arc<dyn ArgumentGenerator>,
    patcher: Option<Arc<PatchController>>,
    recovery: RecoveryEngine,
    runner: RunnerSection,
    active: RwLock<HashMap<RunId, Arc<Mutex<RunState>>>>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl PlanEngine {
    pub fn new(dispatcher: ToolDispatcher, history: Arc<dyn HistoryStore>, runner: RunnerSection) -> Self {
        let context = ContextBuilder::new(history.clone()).with_fallback(runner.dependency_fallback);
        Self {
            dispatcher,
            history,
            context,
            args: Arc::new(DraftArgsGenerator),
            patcher: None,
            recovery: RecoveryEngine::new(),
            runner,
            active: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_argument_generator(mut self, args: Arc<dyn ArgumentGenerator>) -> Self {
        self.args = args;
        self
    }

    pub fn with_patch_controller(mut self, controller: PatchController) -> Self {
        self.patcher = Some(Arc::new(controller));
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.context
    }

    pub async fn active_run_ids(&self) -> Vec<RunId> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self, run_id: &str) -> Option<RunSnapshot> {
        let state = self.active.read().await.get(run_id).cloned()?;
        let s = state.lock().await;
        Some(RunSnapshot {
            run: s.run.clone(),
            plan: s.plan.clone(),
            cursor: s.cursor,
        })
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 接受目标与初始计划并执行到结束。初始计划违反依赖不变式时立即返回错误（配置类错误）
    pub async fn run(&self, objective: &str, plan: Plan) -> Result<RunReport, AgentError> {
        let plan = plan.prepared()?;
        let run = Run::new(objective, plan.clone());
        let run_id = run.run_id.clone();
        self.history.save_plan(&run_id, &plan).await;

        let state = Arc::new(Mutex::new(RunState { run, plan, cursor: 0 }));
        self.active.write().await.insert(run_id.clone(), state.clone());
        tracing::info!(run_id = %run_id, objective = %objective, "run accepted");

        let report = self.drive(&state).await;

        self.active.write().await.remove(&run_id);
        self.history.close_run(&run_id).await;
        self.emit(RunEvent::RunFinished {
            run_id: run_id.clone(),
            status: report.status,
        });
        tracing::info!(
            run_id = %run_id,
            status = ?report.status,
            executed = report.executed_steps,
            patches = report.patches_applied,
            "run finished"
        );
        Ok(report)
    }

    async fn drive(&self, state: &Mutex<RunState>) -> RunReport {
        let (run_id, objective, steps) = {
            let mut s = state.lock().await;
            s.run.status = RunStatus::Running;
            (s.run.run_id.clone(), s.run.objective.clone(), s.plan.len())
        };
        self.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            steps,
        });

        let max_parallel = self.runner.max_parallel.max(1);
        let isolated = self.context.fallback() == DependencyFallback::None;
        let mut counters = Counters::default();

        loop {
            let (plan, cursor) = {
                let s = state.lock().await;
                (s.plan.clone(), s.cursor)
            };
            if cursor >= plan.len() {
                return self.finish(state, RunStatus::Completed, None, &counters).await;
            }

            let batch = if max_parallel > 1 {
                next_batch(&plan.steps, cursor, max_parallel, isolated)
            } else {
                cursor..cursor + 1
            };

            let outcomes: Vec<(usize, StepOutcome)> = if batch.len() == 1 {
                vec![(cursor, self.execute_step(&run_id, &objective, &plan, cursor).await)]
            } else {
                let (rid, obj, snapshot) = (run_id.as_str(), objective.as_str(), &plan);
                join_all(
                    batch
                        .clone()
                        .map(|i| async move { (i, self.execute_step(rid, obj, snapshot, i).await) }),
                )
                .await
            };

            state.lock().await.cursor = batch.end;

            let executed_before = counters.executed;
            let mut retried = false;
            let mut last_index = None;
            let mut failure: Option<(usize, AgentError)> = None;
            for (i, outcome) in outcomes {
                match outcome {
                    StepOutcome::Skipped => {}
                    StepOutcome::Succeeded { retried: r } => {
                        counters.executed += 1;
                        retried |= r;
                        last_index = Some(i);
                    }
                    StepOutcome::Failed { error, retried: r } => {
                        retried |= r;
                        if failure.is_none() {
                            failure = Some((i, error));
                        }
                    }
                }
            }

            if let Some((index, error)) = failure {
                if error.is_configuration() {
                    return self.finish(state, RunStatus::Failed, Some(error), &counters).await;
                }
                if self.runner.patch_on_failure {
                    let trigger = format!("step_failed: {error}");
                    match self.consult(state, index, &trigger).await {
                        PatchVerdict::Applied => {
                            counters.patches += 1;
                            continue;
                        }
                        PatchVerdict::Complete => {
                            return self.finish(state, RunStatus::Completed, None, &counters).await;
                        }
                        PatchVerdict::Continue => {}
                    }
                }
                return self.finish(state, RunStatus::Failed, Some(error), &counters).await;
            }

            let Some(index) = last_index else {
                continue;
            };
            let periodic = self
                .runner
                .patch_every_n_steps
                .filter(|&n| n > 0)
                .is_some_and(|n| counters.executed / n > executed_before / n);
            let trigger = if retried && self.runner.patch_after_retry {
                Some("after_retry")
            } else if self.runner.patch_after_step {
                Some("after_step")
            } else if periodic {
                Some("periodic")
            } else {
                None
            };
            if let Some(trigger) = trigger {
                match self.consult(state, index, trigger).await {
                    PatchVerdict::Applied => counters.patches += 1,
                    PatchVerdict::Complete => {
                        return self.finish(state, RunStatus::Completed, None, &counters).await;
                    }
                    PatchVerdict::Continue => {}
                }
            }
        }
    }

    async fn finish(
        &self,
        state: &Mutex<RunState>,
        status: RunStatus,
        error: Option<AgentError>,
        counters: &Counters,
    ) -> RunReport {
        let mut s = state.lock().await;
        s.run.status = status;
        if let Some(err) = &error {
            tracing::warn!(run_id = %s.run.run_id, error = %err, "run failed");
        }
        RunReport {
            run_id: s.run.run_id.clone(),
            objective: s.run.objective.clone(),
            status,
            executed_steps: counters.executed,
            patches_applied: counters.patches,
            plan: s.plan.clone(),
            error: error.map(|e| e.to_string()),
        }
    }

    /// 执行单个步骤（含重试）
    async fn execute_step(&self, run_id: &str, objective: &str, plan: &Plan, index: usize) -> StepOutcome {
        let Some(step) = plan.get(index) else {
            return StepOutcome::Skipped;
        };
        if step.skip {
            tracing::debug!(run_id = %run_id, step_id = %step.step_id, "step skipped");
            return StepOutcome::Skipped;
        }
        self.emit(RunEvent::StepStarted {
            run_id: run_id.to_string(),
            index,
            step_id: step.step_id.clone(),
            tool: step.tool_name.clone(),
        });

        let descriptors = self.dispatcher.descriptors().await;
        let tool = descriptors.iter().find(|d| d.name == step.tool_name);
        let max_attempts = self.runner.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let context = self.context.messages(run_id, index, attempt > 1).await;
            let dependent = self
                .context
                .dependent_results(run_id, &step.depends_on_step_ids)
                .await;
            let request = ArgRequest {
                run_id,
                objective,
                index,
                step,
                context: &context,
                dependent: dependent.as_ref(),
                tool,
                attempt,
            };

            let error = match self.args.generate(request).await {
                Err(e) => {
                    self.history
                        .append(HistoryEntry::arggen_error(
                            run_id,
                            &step.step_id,
                            index,
                            &step.tool_name,
                            e.clone(),
                            attempt,
                        ))
                        .await;
                    AgentError::ArgumentGeneration(e)
                }
                Ok(args) => match self.dispatch(tool, &step.tool_name, args.clone()).await {
                    Ok(outcome) if outcome.success => {
                        let result = serde_json::to_value(&outcome).unwrap_or(Value::Null);
                        self.history
                            .append(HistoryEntry::tool_result(
                                run_id,
                                &step.step_id,
                                index,
                                &step.tool_name,
                                args,
                                result,
                            ))
                            .await;
                        if attempt > 1 {
                            self.history
                                .append(HistoryEntry::retry_done(
                                    run_id,
                                    &step.step_id,
                                    index,
                                    &step.tool_name,
                                    attempt,
                                    true,
                                ))
                                .await;
                        }
                        tracing::info!(run_id = %run_id, step_id = %step.step_id, tool = %step.tool_name, attempt, "step succeeded");
                        self.emit(RunEvent::StepFinished {
                            run_id: run_id.to_string(),
                            index,
                            step_id: step.step_id.clone(),
                            success: true,
                        });
                        return StepOutcome::Succeeded {
                            retried: attempt > 1,
                        };
                    }
                    Ok(outcome) => {
                        let message = outcome
                            .error_message()
                            .unwrap_or("tool reported failure")
                            .to_string();
                        self.history
                            .append(HistoryEntry::tool_error(
                                run_id,
                                &step.step_id,
                                index,
                                &step.tool_name,
                                args,
                                message.clone(),
                                attempt,
                            ))
                            .await;
                        AgentError::ToolExecutionFailed(message)
                    }
                    Err(e) => {
                        self.history
                            .append(HistoryEntry::tool_error(
                                run_id,
                                &step.step_id,
                                index,
                                &step.tool_name,
                                args,
                                e.to_string(),
                                attempt,
                            ))
                            .await;
                        e
                    }
                },
            };

            if !self.recovery.should_retry(&error, attempt, max_attempts) {
                if attempt > 1 {
                    self.history
                        .append(HistoryEntry::retry_done(
                            run_id,
                            &step.step_id,
                            index,
                            &step.tool_name,
                            attempt,
                            false,
                        ))
                        .await;
                }
                tracing::warn!(run_id = %run_id, step_id = %step.step_id, attempt, error = %error, "step failed");
                self.emit(RunEvent::StepFinished {
                    run_id: run_id.to_string(),
                    index,
                    step_id: step.step_id.clone(),
                    success: false,
                });
                let error = match self.recovery.classify(&error) {
                    RecoveryAction::Retry => AgentError::RetriesExhausted {
                        step_id: step.step_id.clone(),
                        attempts: attempt,
                    },
                    _ => error,
                };
                return StepOutcome::Failed {
                    error,
                    retried: attempt > 1,
                };
            }

            attempt += 1;
            self.history
                .append(HistoryEntry::retry_begin(
                    run_id,
                    &step.step_id,
                    index,
                    &step.tool_name,
                    attempt,
                ))
                .await;
            tracing::info!(run_id = %run_id, step_id = %step.step_id, attempt, error = %error, "retrying step");
            self.emit(RunEvent::Retry {
                run_id: run_id.to_string(),
                step_id: step.step_id.clone(),
                attempt,
                error: error.to_string(),
            });
        }
    }

    /// 按描述里记录的 provider 调用；描述缺失时交给调度器解析（未知工具即配置错误）
    async fn dispatch(
        &self,
        tool: Option<&ToolDescriptor>,
        tool_name: &str,
        args: Value,
    ) -> Result<ToolOutcome, AgentError> {
        match tool {
            Some(descriptor) => self.dispatcher.call_on(&descriptor.provider, tool_name, args).await,
            None => self.dispatcher.call(tool_name, args).await,
        }
    }

    /// 咨询补丁控制器并在需要时应用补丁（持有 run 锁，与游标推进互斥）
    async fn consult(&self, state: &Mutex<RunState>, index: usize, trigger: &str) -> PatchVerdict {
        let Some(patcher) = self.patcher.as_ref().filter(|p| p.is_enabled()) else {
            return PatchVerdict::Continue;
        };

        let (run_id, objective, plan, initial, cursor) = {
            let s = state.lock().await;
            (
                s.run.run_id.clone(),
                s.run.objective.clone(),
                s.plan.clone(),
                s.run.initial_plan.clone(),
                s.cursor,
            )
        };
        let history = self.history.list(&run_id, 0, None).await;
        let last_result = history.iter().rev().find(|e| {
            e.planned_step_index == Some(index)
                && matches!(e.kind, HistoryKind::ToolResult | HistoryKind::ToolError)
        });
        let tools = self.dispatcher.descriptors().await;

        let decision = patcher
            .decide(&PatchInput {
                objective: &objective,
                plan: &plan,
                current_index: index,
                cursor,
                last_result,
                initial_plan: &initial,
                history: &history,
                trigger,
                tools: &tools,
            })
            .await;

        match decision.effective_action() {
            PatchAction::Continue => PatchVerdict::Continue,
            PatchAction::Complete => {
                tracing::info!(run_id = %run_id, reason = %decision.reason, "plan patch marked run complete");
                PatchVerdict::Complete
            }
            PatchAction::Patch => {
                let mut s = state.lock().await;
                match apply_patch(&s.plan.steps, s.cursor, &decision.operations) {
                    Ok(steps) => {
                        s.plan = Plan::new(steps);
                        s.run.status = RunStatus::Patched;
                        self.history.save_plan(&run_id, &s.plan).await;
                        self.history
                            .append(HistoryEntry::plan_patch(
                                &run_id,
                                index,
                                decision.reason.clone(),
                                decision.operations.clone(),
                                true,
                            ))
                            .await;
                        s.run.status = RunStatus::Running;
                        tracing::info!(
                            run_id = %run_id,
                            operations = decision.operations.len(),
                            steps = s.plan.len(),
                            "plan patch applied"
                        );
                        self.emit(RunEvent::PatchApplied {
                            run_id: run_id.clone(),
                            at_index: index,
                            operations: decision.operations.len(),
                            reason: decision.reason.clone(),
                        });
                        PatchVerdict::Applied
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, error = %e, "plan patch rejected");
                        self.history
                            .append(HistoryEntry::plan_patch(
                                &run_id,
                                index,
                                format!("rejected: {e}"),
                                decision.operations.clone(),
                                false,
                            ))
                            .await;
                        self.emit(RunEvent::PatchRejected {
                            run_id: run_id.clone(),
                            at_index: index,
                            error: e.to_string(),
                        });
                        PatchVerdict::Continue
                    }
                }
            }
        }
    }
}
