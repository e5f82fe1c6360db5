use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gpujob_core::config::AppConfig;
use gpujob_core::{DevicePool, JobQueueConnector, ResultStore};
use gpujob_infrastructure::{
    discover_devices, RabbitMqConnector, RedisConnectionManager, RedisDevicePool,
    RedisResultStore,
};
use gpujob_worker::{ConsumerSettings, DeviceLeaser, JobDispatchConsumer, SubprocessSupervisor};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 主应用程序
///
/// 启动时构造全部外部连接，运行期间只有一个消费循环。
pub struct Application {
    config: AppConfig,
    consumer: JobDispatchConsumer,
}

impl Application {
    /// 连接Redis、初始化设备池并准备队列消费者
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序, worker_id={}", config.worker.worker_id);

        let redis = RedisConnectionManager::new(config.redis.clone())
            .await
            .context("连接Redis失败")?;
        let pool: Arc<dyn DevicePool> = Arc::new(RedisDevicePool::new(redis.clone()));
        let store: Arc<dyn ResultStore> = Arc::new(RedisResultStore::new(redis));

        let connector: Arc<dyn JobQueueConnector> = Arc::new(RabbitMqConnector::new(
            config.message_queue.clone(),
            config.worker.worker_id.clone(),
        ));

        Self::from_parts(config, connector, pool, store).await
    }

    /// 使用给定的队列、设备池和结果存储构建应用
    ///
    /// 设备池会按探测到的设备数量重新初始化。
    pub async fn from_parts(
        config: AppConfig,
        connector: Arc<dyn JobQueueConnector>,
        pool: Arc<dyn DevicePool>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        let device_count = discover_devices(config.worker.device_count)
            .await
            .context("探测设备失败")?;
        pool.initialize(device_count)
            .await
            .context("初始化设备池失败")?;
        info!("设备池已初始化, 共 {} 个设备", device_count);

        let leaser = DeviceLeaser::new(
            pool,
            config.worker.lease_max_attempts,
            Duration::from_millis(config.worker.lease_retry_interval_ms),
        );
        let supervisor = SubprocessSupervisor::from_config(&config.worker);
        let settings = ConsumerSettings::from_config(&config.message_queue, &config.redis);
        let consumer = JobDispatchConsumer::new(connector, store, leaser, supervisor, settings);

        Ok(Self { config, consumer })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行直到令牌被取消；队列重连耗尽时返回错误
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Worker {} 开始消费队列 {}",
            self.config.worker.worker_id, self.config.message_queue.queue
        );
        self.consumer
            .run(&cancel)
            .await
            .context("任务消费者异常退出")?;
        Ok(())
    }
}
