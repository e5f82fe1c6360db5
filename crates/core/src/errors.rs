use thiserror::Error;

/// 任务分发错误类型定义
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("没有可用的设备 (已尝试 {attempts} 次)")]
    ResourceExhausted { attempts: u32 },

    #[error("任务消息解码失败: {0}")]
    JobDecode(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("设备发现失败: {0}")]
    DeviceDiscovery(String),

    #[error("序列化错误: {0}")]
    Serialization(String),
}

impl DispatchError {
    /// 是否属于可通过重连恢复的基础设施错误
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::MessageQueue(_))
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_queue_errors_are_transient() {
        assert!(DispatchError::MessageQueue("连接断开".into()).is_transient());
        assert!(!DispatchError::Store("超时".into()).is_transient());
        assert!(!DispatchError::ResourceExhausted { attempts: 10 }.is_transient());
        assert!(!DispatchError::Cancelled.is_transient());
    }

    #[test]
    fn test_resource_exhausted_message() {
        let err = DispatchError::ResourceExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "没有可用的设备 (已尝试 3 次)");
    }
}
