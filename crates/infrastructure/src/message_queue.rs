use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use gpujob_core::{
    config::MessageQueueConfig, DispatchError, JobDelivery, JobQueue, JobQueueConnector, Result,
};
use lapin::{
    options::*, types::FieldTable, Channel, Connection, ConnectionProperties, Consumer,
};
use metrics::counter;
use tracing::{debug, info};

/// RabbitMQ连接工厂
///
/// 每次 `connect` 都建立新的连接和通道，设置 prefetch 并开始消费配置的队列。
pub struct RabbitMqConnector {
    config: MessageQueueConfig,
    consumer_tag: String,
}

impl RabbitMqConnector {
    pub fn new(config: MessageQueueConfig, consumer_tag: impl Into<String>) -> Self {
        Self {
            config,
            consumer_tag: consumer_tag.into(),
        }
    }

    /// 带心跳参数的连接地址
    fn connection_url(&self) -> String {
        if self.config.url.contains("heartbeat=") {
            return self.config.url.clone();
        }
        let separator = if self.config.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}heartbeat={}",
            self.config.url, separator, self.config.heartbeat_seconds
        )
    }

    async fn open_connection(&self) -> Result<Connection> {
        let url = self.connection_url();
        let connect = Connection::connect(&url, ConnectionProperties::default());

        tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| {
            DispatchError::MessageQueue(format!(
                "连接RabbitMQ超时 ({}s)",
                self.config.connection_timeout_seconds
            ))
        })?
        .map_err(|e| DispatchError::MessageQueue(format!("连接RabbitMQ失败: {e}")))
    }

    /// 声明队列
    async fn declare_queue(&self, channel: &Channel) -> Result<()> {
        let queue_name = &self.config.queue;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: self.config.durable_queue,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                DispatchError::MessageQueue(format!("声明队列 {queue_name} 失败: {e}"))
            })?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }
}

#[async_trait]
impl JobQueueConnector for RabbitMqConnector {
    async fn connect(&self) -> Result<Box<dyn JobQueue>> {
        counter!("gpujob_queue_connect_attempts_total").increment(1);
        let connection = self.open_connection().await?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DispatchError::MessageQueue(format!("创建通道失败: {e}")))?;

        self.declare_queue(&channel).await?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| DispatchError::MessageQueue(format!("设置prefetch失败: {e}")))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DispatchError::MessageQueue(format!("创建消费者失败: {e}")))?;

        info!(
            "成功连接到RabbitMQ, queue={}, consumer_tag={}",
            self.config.queue, self.consumer_tag
        );

        Ok(Box::new(RabbitMqJobQueue {
            connection,
            channel,
            consumer,
            queue: self.config.queue.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("RabbitMQ队列 {}", self.config.queue)
    }
}

/// 已建立的RabbitMQ消费连接
pub struct RabbitMqJobQueue {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    queue: String,
}

#[async_trait]
impl JobQueue for RabbitMqJobQueue {
    async fn next_delivery(&mut self) -> Result<Option<JobDelivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(JobDelivery {
                delivery_tag: delivery.delivery_tag,
                payload: delivery.data,
            })),
            Some(Err(e)) => Err(DispatchError::MessageQueue(format!("接收消息失败: {e}"))),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| DispatchError::MessageQueue(format!("确认消息失败: {e}")))?;

        debug!("消息已确认: delivery_tag={}", delivery_tag);
        Ok(())
    }

    async fn delete_queue(&self) -> Result<()> {
        self.channel
            .queue_delete(&self.queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| {
                DispatchError::MessageQueue(format!("删除队列 {} 失败: {e}", self.queue))
            })?;

        info!("队列 {} 已删除", self.queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            debug!("RabbitMQ连接已断开，跳过关闭");
            return Ok(());
        }

        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| DispatchError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(url: &str) -> RabbitMqConnector {
        let config = MessageQueueConfig {
            url: url.to_string(),
            queue: "gpu_tasks_test".to_string(),
            ..Default::default()
        };
        RabbitMqConnector::new(config, "worker-1")
    }

    #[test]
    fn test_connection_url_appends_heartbeat() {
        assert_eq!(
            connector("amqp://localhost:5672/%2f").connection_url(),
            "amqp://localhost:5672/%2f?heartbeat=600"
        );
        assert_eq!(
            connector("amqp://localhost:5672/%2f?frame_max=8192").connection_url(),
            "amqp://localhost:5672/%2f?frame_max=8192&heartbeat=600"
        );
    }

    #[test]
    fn test_explicit_heartbeat_is_kept() {
        let url = "amqp://localhost:5672/%2f?heartbeat=30";
        assert_eq!(connector(url).connection_url(), url);
    }

    #[test]
    fn test_describe_names_queue() {
        assert_eq!(connector("amqp://localhost").describe(), "RabbitMQ队列 gpu_tasks_test");
    }
}
