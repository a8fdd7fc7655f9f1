use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use conveyor_api::AppState;
use conveyor_core::{AppConfig, Client, HandlerRegistry, Inspector, NoopHandler, QueueStore};
use conveyor_infrastructure::RedisStore;
use conveyor_worker::Launcher;

use crate::shutdown::ShutdownManager;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅处理任务
    Worker,
    /// 仅运行监控API
    Api,
    /// 处理任务并提供监控API
    All,
}

impl AppMode {
    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    fn runs_api(self, config: &AppConfig) -> bool {
        match self {
            AppMode::Api => true,
            AppMode::All => config.api.enabled,
            AppMode::Worker => false,
        }
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn QueueStore>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        let store = RedisStore::connect(&config.redis)
            .await
            .context("连接Redis失败")?;

        Ok(Self {
            config,
            mode,
            store: Arc::new(store),
        })
    }

    /// 内置处理器，业务处理器由嵌入方在自己的二进制中注册
    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("Noop", Arc::new(NoopHandler));
        registry
    }

    /// 运行到收到关闭信号，或启动器自行退出
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        let api_handle = if self.mode.runs_api(&self.config) {
            Some(self.spawn_api(shutdown.clone()))
        } else {
            None
        };

        let outcome = if self.mode.runs_worker() {
            self.run_worker(&shutdown).await
        } else {
            shutdown.wait().await;
            Ok(())
        };

        // 启动器自行退出时API随之退出
        shutdown.shutdown().await;

        if let Some(handle) = api_handle {
            match handle.await {
                Ok(Ok(())) => info!("API服务已停止"),
                Ok(Err(e)) => error!("API服务异常退出: {e}"),
                Err(e) => error!("API服务任务异常: {e}"),
            }
        }

        outcome
    }

    async fn run_worker(&self, shutdown: &ShutdownManager) -> Result<()> {
        let launcher = Arc::new(Launcher::new(
            Arc::clone(&self.store),
            Arc::new(Self::registry()),
            &self.config,
            Vec::new(),
        )?);

        launcher.start().await.context("启动任务处理进程失败")?;
        info!("任务处理进程 {} 已启动", launcher.identity());

        let quiet_handle = spawn_quiet_listener(Arc::clone(&launcher));
        let waiter = shutdown.clone();
        let result = launcher.run_until(async move { waiter.wait().await }).await;
        if let Some(handle) = quiet_handle {
            handle.abort();
        }

        result.context("任务处理进程异常退出")
    }

    fn spawn_api(&self, shutdown: ShutdownManager) -> JoinHandle<conveyor_core::ConveyorResult<()>> {
        let state = AppState::new(
            Inspector::new(Arc::clone(&self.store)),
            Client::new(Arc::clone(&self.store)),
        );
        let bind_address = self.config.api.bind_address.clone();

        tokio::spawn(async move {
            conveyor_api::serve(&bind_address, state, async move { shutdown.wait().await }).await
        })
    }
}

#[cfg(target_os = "linux")]
const SIGTSTP: i32 = 20;
#[cfg(all(unix, not(target_os = "linux")))]
const SIGTSTP: i32 = 18;

/// SIGTSTP 让进程静默：不再领取新任务，进行中的任务照常完成
#[cfg(unix)]
fn spawn_quiet_listener(launcher: Arc<Launcher>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut tstp = match signal(SignalKind::from_raw(SIGTSTP)) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("安装SIGTSTP信号处理器失败: {e}");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while tstp.recv().await.is_some() {
            info!("收到SIGTSTP信号，进入静默状态");
            launcher.quiet();
        }
    }))
}

#[cfg(not(unix))]
fn spawn_quiet_listener(_launcher: Arc<Launcher>) -> Option<JoinHandle<()>> {
    None
}
