use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;

/// 任务结果存储
///
/// 每个任务键对应一组扁平字段，字段只会被覆盖或新增，不会被删除。
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 原子地写入一组字段
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// 读取单个字段
    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// 读取任务键下的全部字段
    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>>;
}
