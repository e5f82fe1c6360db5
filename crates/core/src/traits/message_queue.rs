use async_trait::async_trait;

use crate::Result;

/// 从队列投递的一条原始消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDelivery {
    /// 确认消息时使用的投递标签
    pub delivery_tag: u64,
    /// 原始负载，可能经过zlib压缩
    pub payload: Vec<u8>,
}

/// 任务队列抽象接口
///
/// 一个实例对应一条已建立的队列连接，同一时刻最多只有一条未确认的消息。
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 等待下一条消息，连接正常关闭时返回 `None`
    async fn next_delivery(&mut self) -> Result<Option<JobDelivery>>;

    /// 确认消息处理完成
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// 删除当前消费的队列
    async fn delete_queue(&self) -> Result<()>;

    /// 关闭连接
    async fn close(&self) -> Result<()>;
}

/// 任务队列连接工厂
#[async_trait]
pub trait JobQueueConnector: Send + Sync {
    /// 建立连接、声明队列并开始消费
    async fn connect(&self) -> Result<Box<dyn JobQueue>>;

    /// 连接目标描述，仅用于日志
    fn describe(&self) -> String;
}
