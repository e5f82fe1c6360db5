use std::sync::Arc;
use std::time::{Duration, Instant};

use gpujob_core::{DevicePool, DispatchError, Result};
use metrics::histogram;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 按固定间隔轮询设备池，直到租到设备或超过尝试次数
pub struct DeviceLeaser {
    pool: Arc<dyn DevicePool>,
    max_attempts: u32,
    retry_interval: Duration,
}

impl DeviceLeaser {
    pub fn new(pool: Arc<dyn DevicePool>, max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            pool,
            max_attempts,
            retry_interval,
        }
    }

    /// 租用一个设备
    ///
    /// 超过尝试次数返回 `ResourceExhausted`，等待期间收到取消信号返回 `Cancelled`。
    pub async fn lease(&self, cancel: &CancellationToken) -> Result<DeviceLease> {
        let started = Instant::now();

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            if let Some(device_id) = self.pool.try_lease().await? {
                let waited = started.elapsed();
                histogram!("gpujob_device_lease_wait_ms").record(waited.as_millis() as f64);
                info!(
                    device_id,
                    attempt,
                    "租用设备成功, 等待 {}ms",
                    waited.as_millis()
                );
                return Ok(DeviceLease::new(Arc::clone(&self.pool), device_id));
            }

            debug!(attempt, "暂无空闲设备, {}ms 后重试", self.retry_interval.as_millis());
            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    _ = sleep(self.retry_interval) => {}
                }
            }
        }

        warn!("尝试 {} 次后仍无空闲设备", self.max_attempts);
        Err(DispatchError::ResourceExhausted {
            attempts: self.max_attempts,
        })
    }
}

/// 已租用的设备
///
/// 调用 `release` 归还；未归还就被丢弃时会在后台归还。
pub struct DeviceLease {
    pool: Arc<dyn DevicePool>,
    device_id: u32,
    released: bool,
}

impl DeviceLease {
    fn new(pool: Arc<dyn DevicePool>, device_id: u32) -> Self {
        Self {
            pool,
            device_id,
            released: false,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// 归还设备
    ///
    /// 失败时返回错误，租约随后被丢弃并转入后台重试归还。
    pub async fn release(mut self) -> Result<()> {
        self.pool.release(self.device_id).await?;
        self.released = true;
        info!(device_id = self.device_id, "设备已归还");
        Ok(())
    }
}

const BACKGROUND_RELEASE_ATTEMPTS: u32 = 5;
const BACKGROUND_RELEASE_INTERVAL: Duration = Duration::from_millis(200);

async fn release_in_background(pool: Arc<dyn DevicePool>, device_id: u32) {
    for attempt in 1..=BACKGROUND_RELEASE_ATTEMPTS {
        match pool.release(device_id).await {
            Ok(()) => {
                info!(device_id, attempt, "后台归还设备成功");
                return;
            }
            Err(e) if attempt < BACKGROUND_RELEASE_ATTEMPTS => {
                warn!(device_id, attempt, "后台归还设备失败, 稍后重试: {}", e);
                sleep(BACKGROUND_RELEASE_INTERVAL * attempt).await;
            }
            Err(e) => error!(
                device_id,
                "后台归还设备失败, 已尝试 {} 次: {}", BACKGROUND_RELEASE_ATTEMPTS, e
            ),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let device_id = self.device_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(device_id, "租约未显式归还, 后台归还设备");
                handle.spawn(release_in_background(Arc::clone(&self.pool), device_id));
            }
            Err(_) => error!(device_id, "没有可用的运行时, 设备未能归还"),
        }
    }
}
