use std::collections::HashMap;

use async_trait::async_trait;
use gpujob_core::{DispatchError, Result, ResultStore};
use redis::AsyncCommands;

use super::connection_manager::RedisConnectionManager;

/// 基于Redis哈希的任务结果存储
pub struct RedisResultStore {
    connection_manager: RedisConnectionManager,
}

impl RedisResultStore {
    pub fn new(connection_manager: RedisConnectionManager) -> Self {
        Self { connection_manager }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            pipe.hset(key, field, value).ignore();
        }

        let mut conn = self.connection_manager.connection();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| DispatchError::Store(format!("写入结果 {key} 失败: {e}")))
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.connection();
        conn.hget(key, field)
            .await
            .map_err(|e| DispatchError::Store(format!("读取结果 {key}.{field} 失败: {e}")))
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection_manager.connection();
        conn.hgetall(key)
            .await
            .map_err(|e| DispatchError::Store(format!("读取结果 {key} 失败: {e}")))
    }
}
