use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tokio::signal;
use tracing::{error, info, warn};

use conveyor_core::config::{ConfigValidator, LogFormat};
use conveyor_core::{init_logging, AppConfig};
use conveyor_infrastructure::init_prometheus_exporter;

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("conveyor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式后台任务处理引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找 config/conveyor.toml、conveyor.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["worker", "api", "all"])
                .default_value("worker"),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .value_name("N")
                .help("并发执行的任务数")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("queue")
                .short('q')
                .long("queue")
                .value_name("QUEUE[,WEIGHT]")
                .help("处理的队列，可重复指定")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("tag")
                .short('g')
                .long("tag")
                .value_name("TAG")
                .help("进程标签，显示在进程列表中"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;

    if let Some(concurrency) = matches.get_one::<usize>("concurrency") {
        config.worker.concurrency = *concurrency;
    }
    if let Some(queues) = matches.get_many::<String>("queue") {
        config.worker.queues = queues.cloned().collect();
    }
    if let Some(tag) = matches.get_one::<String>("tag") {
        config.worker.tag = Some(tag.clone());
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    config.validate().context("命令行参数校验失败")?;

    init_logging(&config.observability)?;
    info!("启动分布式后台任务处理引擎");

    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_bind_address
            .parse()
            .context("metrics_bind_address 不是有效的地址")?;
        init_prometheus_exporter(addr)?;
    }

    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("api") => AppMode::Api,
        Some("all") => AppMode::All,
        _ => AppMode::Worker,
    };
    info!("运行模式: {:?}", mode);

    let shutdown_timeout = Duration::from_secs(config.worker.shutdown_timeout_seconds + 5);
    let app = Application::new(config, mode).await?;
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move { app.run(shutdown_manager).await })
    };
    tokio::pin!(app_handle);

    let exited_early = tokio::select! {
        _ = wait_for_shutdown_signal() => false,
        _ = shutdown_manager.wait() => true,
    };

    if !exited_early {
        info!("收到关闭信号，开始优雅关闭...");
        shutdown_manager.shutdown().await;
    }

    let outcome = match tokio::time::timeout(shutdown_timeout, &mut app_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("应用已优雅关闭");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            error!("应用运行失败: {e:#}");
            Err(e)
        }
        Ok(Err(e)) => {
            error!("应用任务异常: {e}");
            Err(anyhow::anyhow!("应用任务异常: {e}"))
        }
        Err(_) => {
            warn!("应用关闭超时，强制退出");
            Ok(())
        }
    };

    info!("分布式后台任务处理引擎已退出");
    outcome
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
