use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 持有根取消令牌，所有挂起点都监听它的子令牌。
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取一个随关闭而取消的令牌
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_issued_tokens() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());

        manager.shutdown();
        manager.shutdown();

        token.cancelled().await;
        assert!(manager.is_shutdown());
        assert!(manager.token().is_cancelled());
    }
}
