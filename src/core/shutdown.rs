//! 优雅关闭
//!
//! ShutdownManager 把 Ctrl+C / SIGTERM 转成一个 CancellationToken，并记住第一次触发的原因；
//! ShutdownCoordinator 在主循环退出后依次执行清理任务（关闭 provider 连接、清空会话表），
//! 每个任务有独立的超时，单个任务失败不影响其余任务。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::mcp::{ClientManager, SessionTable};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：token 负责唤醒等待方，watch 通道保存首次触发的原因
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason,
        }
    }

    /// 子任务（服务端 accept 循环、会话 reaper）持有的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            tracing::info!(reason = ?reason, "shutdown requested");
            *current = Some(reason);
            true
        });
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C（以及 unix 上的 SIGTERM），收到后触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        if term.recv().await.is_some() {
                            manager.shutdown(ShutdownReason::Signal);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
                }
            });
        }
    }
}

/// 关闭阶段要执行的一项清理
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，返回成功完成的任务数
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.per_task_timeout = Duration::from_secs(secs);
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    pub async fn run_cleanup(&self) -> usize {
        let mut completed = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::debug!(task = task.name(), "cleanup done");
                }
                Ok(Err(e)) => tracing::warn!(task = task.name(), error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = task.name(),
                    timeout_secs = self.per_task_timeout.as_secs(),
                    "cleanup timed out"
                ),
            }
        }
        tracing::info!(
            completed,
            total = self.tasks.len(),
            reason = ?self.manager.reason(),
            "shutdown cleanup finished"
        );
        completed
    }
}

/// 关闭所有外部 provider 连接（子进程被终止，挂起的调用以 closed 返回）
pub struct ProviderCleanup {
    clients: ClientManager,
}

impl ProviderCleanup {
    pub fn new(clients: ClientManager) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ShutdownCleanup for ProviderCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.clients.close_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "providers"
    }
}

/// 清空服务端会话表（SSE 流随之结束）
pub struct SessionCleanup {
    sessions: Arc<SessionTable>,
}

impl SessionCleanup {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ShutdownCleanup for SessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.sessions.close_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sessions"
    }
}
