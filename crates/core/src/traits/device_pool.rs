use async_trait::async_trait;

use crate::Result;

/// 共享设备池
///
/// 所有Worker进程共享同一个空闲设备序列。租用和归还必须是针对共享存储的单次原子操作。
#[async_trait]
pub trait DevicePool: Send + Sync {
    /// 用 `0..device_count` 覆盖空闲序列
    async fn initialize(&self, device_count: u32) -> Result<()>;

    /// 原子地取出第一个空闲设备，没有空闲设备时返回 `None`
    async fn try_lease(&self) -> Result<Option<u32>>;

    /// 原子地把设备追加回空闲序列末尾
    async fn release(&self, device_id: u32) -> Result<()>;

    /// 当前空闲设备快照
    async fn free_devices(&self) -> Result<Vec<u32>>;
}
