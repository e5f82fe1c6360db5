use std::sync::Arc;
use std::time::{Duration, Instant};

use gpujob_core::{
    DispatchError, JobDelivery, JobDescriptor, JobQueue, JobQueueConnector, JobResultRecord,
    MessageQueueConfig, RedisConfig, Result, ResultStore,
};
use metrics::{counter, histogram};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::lease::DeviceLeaser;
use crate::progress::ProgressRecorder;
use crate::supervisor::{ExecutionOutcome, SubprocessSupervisor};

/// 消费者运行参数
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// 队列连接的最大尝试次数
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub result_key_prefix: String,
    pub delete_queue_on_shutdown: bool,
}

impl ConsumerSettings {
    pub fn from_config(queue: &MessageQueueConfig, redis: &RedisConfig) -> Self {
        Self {
            max_retries: queue.max_retries,
            retry_delay: Duration::from_secs(queue.retry_delay_seconds),
            result_key_prefix: redis.result_key_prefix.clone(),
            delete_queue_on_shutdown: queue.delete_queue_on_shutdown,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            result_key_prefix: "job_result".to_string(),
            delete_queue_on_shutdown: false,
        }
    }
}

enum LoopEvent {
    Delivery(JobDelivery),
    ConnectionLost(DispatchError),
    Shutdown,
}

/// 训练任务分发消费者
///
/// 一次只处理一条消息：解码任务、租用设备、运行训练、归还设备、确认消息。
/// 任务本身的失败不会影响消息循环；只有连接失败和关闭信号会结束循环。
pub struct JobDispatchConsumer {
    connector: Arc<dyn JobQueueConnector>,
    store: Arc<dyn ResultStore>,
    leaser: DeviceLeaser,
    supervisor: SubprocessSupervisor,
    settings: ConsumerSettings,
}

impl JobDispatchConsumer {
    pub fn new(
        connector: Arc<dyn JobQueueConnector>,
        store: Arc<dyn ResultStore>,
        leaser: DeviceLeaser,
        supervisor: SubprocessSupervisor,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            connector,
            store,
            leaser,
            supervisor,
            settings,
        }
    }

    /// 运行消息循环直到收到关闭信号
    ///
    /// 重连次数耗尽时返回错误。
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        info!("任务消费者启动: {}", self.connector.describe());

        let Some(mut queue) = self.connect_with_retry(cancel).await? else {
            info!("连接队列期间收到关闭信号");
            return Ok(());
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => LoopEvent::Shutdown,
                next = queue.next_delivery() => match next {
                    Ok(Some(delivery)) => LoopEvent::Delivery(delivery),
                    Ok(None) => LoopEvent::ConnectionLost(DispatchError::MessageQueue(
                        "消费流已结束".to_string(),
                    )),
                    Err(e) => LoopEvent::ConnectionLost(e),
                },
            };

            match event {
                LoopEvent::Delivery(delivery) => {
                    self.handle_delivery(queue.as_ref(), delivery, cancel).await;
                }
                LoopEvent::ConnectionLost(e) if e.is_transient() => {
                    counter!("gpujob_queue_reconnects_total").increment(1);
                    warn!("队列连接中断, 准备重连: {}", e);
                    if let Err(e) = queue.close().await {
                        warn!("关闭旧连接失败: {}", e);
                    }
                    match self.connect_with_retry(cancel).await? {
                        Some(reconnected) => queue = reconnected,
                        None => {
                            info!("重连期间收到关闭信号");
                            return Ok(());
                        }
                    }
                }
                LoopEvent::ConnectionLost(e) => {
                    error!("消费队列失败: {}", e);
                    self.shutdown(queue.as_ref()).await;
                    return Err(e);
                }
                LoopEvent::Shutdown => break,
            }
        }

        self.shutdown(queue.as_ref()).await;
        Ok(())
    }

    /// 连接队列，最多尝试 `max_retries` 次
    ///
    /// 等待期间收到关闭信号时返回 `Ok(None)`。
    pub async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn JobQueue>>> {
        let max_retries = self.settings.max_retries;

        for attempt in 1..=max_retries {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(queue) => {
                    info!(attempt, "已连接到 {}", self.connector.describe());
                    return Ok(Some(queue));
                }
                Err(e) => {
                    warn!(attempt, max_retries, "连接队列失败: {}", e);
                }
            }

            if attempt < max_retries {
                info!("{}s 后重试", self.settings.retry_delay.as_secs());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    _ = sleep(self.settings.retry_delay) => {}
                }
            }
        }

        error!("达到最大重试次数, 无法连接到 {}", self.connector.describe());
        Err(DispatchError::MessageQueue(format!(
            "连接 {} 失败, 已尝试 {} 次",
            self.connector.describe(),
            max_retries
        )))
    }

    /// 处理一条消息，无论任务成败都会确认
    pub async fn handle_delivery(
        &self,
        queue: &dyn JobQueue,
        delivery: JobDelivery,
        cancel: &CancellationToken,
    ) {
        let delivery_tag = delivery.delivery_tag;

        match JobDescriptor::decode(&delivery.payload) {
            Ok(job) => {
                let job_key = job.job_key(&self.settings.result_key_prefix);
                let span = info_span!("job", job_key = %job_key, delivery_tag);
                self.dispatch_job(&job, &job_key, cancel)
                    .instrument(span)
                    .await;
            }
            Err(e) => {
                counter!("gpujob_malformed_messages_total").increment(1);
                error!(delivery_tag, "任务消息无法解码, 直接确认丢弃: {}", e);
            }
        }

        if let Err(e) = queue.ack(delivery_tag).await {
            error!(delivery_tag, "确认消息失败: {}", e);
        }
    }

    async fn dispatch_job(&self, job: &JobDescriptor, job_key: &str, cancel: &CancellationToken) {
        info!(
            "收到训练任务: user={}, model={}, script={}",
            job.user, job.model_name, job.script_path
        );
        let started = Instant::now();

        let lease = match self.leaser.lease(cancel).await {
            Ok(lease) => lease,
            Err(DispatchError::Cancelled) => {
                counter!("gpujob_jobs_total", "outcome" => "cancelled").increment(1);
                warn!("等待设备期间收到关闭信号, 任务未启动");
                return;
            }
            Err(e) => {
                counter!("gpujob_jobs_total", "outcome" => "lease_failed").increment(1);
                error!("租用设备失败, 任务未启动: {}", e);
                return;
            }
        };

        let device_id = lease.device_id();
        let mut recorder = ProgressRecorder::new(Arc::clone(&self.store), job_key);
        let outcome = self
            .supervisor
            .run(job, device_id, &mut recorder, cancel)
            .await;

        if let Err(e) = lease.release().await {
            error!(device_id, "归还设备失败, 转入后台重试: {}", e);
        }

        histogram!("gpujob_job_duration_ms").record(started.elapsed().as_millis() as f64);
        counter!("gpujob_jobs_total", "outcome" => outcome.label()).increment(1);

        match outcome {
            ExecutionOutcome::Succeeded => {
                self.report_final_metric(job_key).await;
            }
            ExecutionOutcome::Failed { exit_code, .. } => {
                error!("训练任务失败: user={}, exit_code={:?}", job.user, exit_code);
            }
            ExecutionOutcome::LaunchFailed { reason } => {
                error!("训练任务启动失败: user={}, {}", job.user, reason);
            }
            ExecutionOutcome::Cancelled => {
                warn!("训练任务被取消, 按失败处理: user={}", job.user);
            }
        }
    }

    /// 报告最大轮次的验证指标
    pub async fn report_final_metric(&self, job_key: &str) -> Option<String> {
        let fields = match self.store.get_all(job_key).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!("读取任务结果失败: {}", e);
                return None;
            }
        };

        let record = JobResultRecord::from_fields(&fields);
        let Some(epoch) = record.final_epoch() else {
            warn!("任务完成, 但未找到任何轮次记录, 没有最终指标");
            return None;
        };

        match record.final_val_metric() {
            Some(metric) => {
                info!("任务完成, 最终验证指标 (epoch {}): {}", epoch, metric);
                Some(metric.to_string())
            }
            None => {
                warn!("任务完成, 但轮次 {} 没有验证指标", epoch);
                None
            }
        }
    }

    async fn shutdown(&self, queue: &dyn JobQueue) {
        if self.settings.delete_queue_on_shutdown {
            match queue.delete_queue().await {
                Ok(()) => info!("已删除队列"),
                Err(e) => warn!("删除队列失败: {}", e),
            }
        }

        if let Err(e) = queue.close().await {
            warn!("关闭队列连接失败: {}", e);
        }
        info!("任务消费者已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpujob_core::DevicePool;
    use gpujob_infrastructure::{InMemoryBroker, InMemoryDevicePool, InMemoryResultStore};

    fn consumer(store: Arc<InMemoryResultStore>) -> JobDispatchConsumer {
        let pool: Arc<dyn DevicePool> = Arc::new(InMemoryDevicePool::new());
        JobDispatchConsumer::new(
            Arc::new(InMemoryBroker::new()),
            store,
            DeviceLeaser::new(pool, 1, Duration::from_millis(1)),
            SubprocessSupervisor::new("sh"),
            ConsumerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_final_metric_from_highest_epoch() {
        let store = Arc::new(InMemoryResultStore::new());
        store
            .set_fields(
                "k",
                &[
                    ("epoch_2_val_metric".to_string(), "0.8000".to_string()),
                    ("epoch_10_val_metric".to_string(), "0.9500".to_string()),
                    ("epoch_9_val_metric".to_string(), "0.9900".to_string()),
                ],
            )
            .await
            .unwrap();

        let consumer = consumer(store);
        assert_eq!(
            consumer.report_final_metric("k").await.as_deref(),
            Some("0.9500")
        );
    }

    #[tokio::test]
    async fn test_final_metric_missing_is_not_an_error() {
        let consumer = consumer(Arc::new(InMemoryResultStore::new()));
        assert_eq!(consumer.report_final_metric("missing").await, None);
    }

    #[test]
    fn test_settings_from_config() {
        let queue = MessageQueueConfig {
            max_retries: 3,
            retry_delay_seconds: 2,
            delete_queue_on_shutdown: true,
            ..Default::default()
        };
        let settings = ConsumerSettings::from_config(&queue, &RedisConfig::default());
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_delay, Duration::from_secs(2));
        assert_eq!(settings.result_key_prefix, "job_result");
        assert!(settings.delete_queue_on_shutdown);
    }
}
