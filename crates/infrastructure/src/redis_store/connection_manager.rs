use std::time::Duration;

use gpujob_core::{config::RedisConfig, DispatchError, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Redis连接管理
///
/// 持有一个自动重连的 `ConnectionManager`，克隆开销很小，设备池和结果存储共用。
#[derive(Clone)]
pub struct RedisConnectionManager {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisConnectionManager {
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.build_url())
            .map_err(|e| DispatchError::Store(format!("创建Redis客户端失败: {e}")))?;

        let connection = Self::connect_with_retry(&client, &config).await?;
        let manager = Self { connection, config };
        manager.ping().await?;
        debug!(
            "成功连接到Redis {}:{}",
            manager.config.host, manager.config.port
        );

        Ok(manager)
    }

    async fn connect_with_retry(client: &Client, config: &RedisConfig) -> Result<ConnectionManager> {
        let mut last_error = String::from("Unknown");

        for attempt in 0..config.max_retry_attempts {
            let connect = tokio::time::timeout(
                Duration::from_secs(config.connection_timeout_seconds),
                client.get_connection_manager(),
            );
            match connect.await {
                Ok(Ok(conn)) => {
                    if attempt > 0 {
                        debug!("第 {} 次尝试后重新连接到Redis", attempt + 1);
                    }
                    return Ok(conn);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("连接超时 ({}s)", config.connection_timeout_seconds)
                }
            }

            if attempt + 1 < config.max_retry_attempts {
                warn!(
                    "连接Redis失败 (尝试 {}/{}): {}. {}s后重试...",
                    attempt + 1,
                    config.max_retry_attempts,
                    last_error,
                    config.retry_delay_seconds
                );
                sleep(Duration::from_secs(config.retry_delay_seconds)).await;
            }
        }

        let error_msg = format!(
            "连接Redis失败, 已尝试 {} 次. 最后错误: {}",
            config.max_retry_attempts, last_error
        );
        error!("{}", error_msg);
        Err(DispatchError::Store(error_msg))
    }

    /// 获取一个连接句柄
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::Store(format!("Redis PING失败: {e}")))?;

        if response == "PONG" {
            Ok(())
        } else {
            Err(DispatchError::Store(format!(
                "意外的PING响应: {response}"
            )))
        }
    }
}
