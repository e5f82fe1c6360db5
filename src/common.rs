use std::net::SocketAddr;

use anyhow::{Context, Result};
use gpujob_core::config::{AppConfig, ObservabilityConfig};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 命令行给出的启动参数，优先级高于配置文件和环境变量
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub worker_id: Option<String>,
    pub device_count: Option<u32>,
    pub queue: Option<String>,
}

/// 初始化日志系统
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 按配置启动Prometheus指标端点
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {e}"))?;

    describe_counter!("gpujob_jobs_total", "按结果统计的训练任务数");
    describe_counter!("gpujob_queue_reconnects_total", "队列重连次数");
    describe_counter!("gpujob_malformed_messages_total", "无法解码的任务消息数");
    describe_counter!("gpujob_parse_errors_total", "格式错误的训练输出行数");
    describe_histogram!("gpujob_job_duration_ms", Unit::Milliseconds, "任务耗时");
    describe_histogram!("gpujob_device_lease_wait_ms", Unit::Milliseconds, "等待设备耗时");

    info!("Prometheus指标端点已启动: {}", addr);
    Ok(())
}

/// 加载配置并应用命令行覆盖，覆盖之后统一校验
pub fn load_config(options: &StartupOptions) -> Result<AppConfig> {
    let mut config = AppConfig::load(options.config_path.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            options.config_path.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    apply_overrides(&mut config, options);
    config.validate()?;

    Ok(config)
}

fn apply_overrides(config: &mut AppConfig, options: &StartupOptions) {
    if let Some(level) = &options.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &options.log_format {
        config.observability.log_format = format.clone();
    }
    if let Some(worker_id) = &options.worker_id {
        config.worker.worker_id = worker_id.clone();
    }
    if let Some(count) = options.device_count {
        config.worker.device_count = Some(count);
    }
    if let Some(queue) = &options.queue {
        config.message_queue.queue = queue.clone();
    }
}
