use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use gpujob::app::Application;
use gpujob::common::{init_logging, init_metrics, load_config, StartupOptions};
use gpujob::shutdown::ShutdownManager;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let options = parse_args();
    let config = load_config(&options)?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    init_metrics(&config.observability)?;

    info!("启动GPU训练任务分发Worker");
    if let Some(path) = &options.config_path {
        info!("配置文件: {path}");
    }

    let app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();

    let token = shutdown_manager.token();
    let mut app_handle = tokio::spawn(async move { app.run(token).await });

    tokio::select! {
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用运行失败: {e:#}");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("应用任务异常结束: {e}")),
            };
        }
        signal = wait_for_shutdown_signal() => signal?,
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => {
            error!("应用关闭时发生错误: {e:#}");
            return Err(e);
        }
        Ok(Err(e)) => error!("应用任务异常结束: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("GPU训练任务分发Worker已退出");
    Ok(())
}

fn parse_args() -> StartupOptions {
    let matches = Command::new("gpujob")
        .version(env!("CARGO_PKG_VERSION"))
        .about("GPU训练任务分发Worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时查找默认路径"),
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
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID，同时用作消费者标签"),
        )
        .arg(
            Arg::new("device-count")
                .long("device-count")
                .value_name("N")
                .help("设备数量，指定后不再调用nvidia-smi")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("queue")
                .short('q')
                .long("queue")
                .value_name("NAME")
                .help("消费的队列名称"),
        )
        .get_matches();

    StartupOptions {
        config_path: matches.get_one::<String>("config").cloned(),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format: matches.get_one::<String>("log-format").cloned(),
        worker_id: matches.get_one::<String>("worker-id").cloned(),
        device_count: matches.get_one::<u32>("device-count").copied(),
        queue: matches.get_one::<String>("queue").cloned(),
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;

        tokio::select! {
            ctrl_c = signal::ctrl_c() => {
                ctrl_c.context("安装Ctrl+C信号处理器失败")?;
                info!("收到Ctrl+C信号");
            },
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}
