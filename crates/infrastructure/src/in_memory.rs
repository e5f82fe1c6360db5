//! 内存实现的队列、设备池和结果存储
//!
//! 不依赖外部服务，用于嵌入式运行和测试。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gpujob_core::{
    DevicePool, DispatchError, JobDelivery, JobQueue, JobQueueConnector, Result, ResultStore,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

/// 内存设备池
#[derive(Debug, Default)]
pub struct InMemoryDevicePool {
    free: Mutex<VecDeque<u32>>,
}

impl InMemoryDevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定的空闲序列创建设备池
    pub fn with_free_devices(devices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            free: Mutex::new(devices.into_iter().collect()),
        }
    }
}

#[async_trait]
impl DevicePool for InMemoryDevicePool {
    async fn initialize(&self, device_count: u32) -> Result<()> {
        *self.free.lock().await = (0..device_count).collect();
        Ok(())
    }

    async fn try_lease(&self) -> Result<Option<u32>> {
        Ok(self.free.lock().await.pop_front())
    }

    async fn release(&self, device_id: u32) -> Result<()> {
        self.free.lock().await.push_back(device_id);
        Ok(())
    }

    async fn free_devices(&self) -> Result<Vec<u32>> {
        Ok(self.free.lock().await.iter().copied().collect())
    }
}

/// 内存结果存储
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有任务键
    pub async fn keys(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut records = self.records.write().await;
        let record = records.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let records = self.records.read().await;
        Ok(records.get(key).and_then(|r| r.get(field).cloned()))
    }

    async fn get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let records = self.records.read().await;
        Ok(records.get(key).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    pending: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    acked: Mutex<Vec<u64>>,
    next_tag: AtomicU64,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    severed: AtomicBool,
    closed: AtomicU32,
    deleted: AtomicBool,
}

/// 内存消息代理
///
/// 同时充当连接工厂，可以模拟连接失败和连接中断。
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 投递一条消息
    pub async fn publish(&self, payload: impl Into<Vec<u8>>) {
        self.state.pending.lock().await.push_back(payload.into());
        self.state.notify.notify_one();
    }

    /// 接下来的 `count` 次连接尝试都会失败
    pub fn fail_next_connects(&self, count: u32) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// 中断当前连接，正在等待的消费者会收到错误
    pub fn sever_connection(&self) {
        self.state.severed.store(true, Ordering::SeqCst);
        self.state.notify.notify_one();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.state.acked.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.pending.lock().await.len()
    }

    pub fn close_count(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn queue_deleted(&self) -> bool {
        self.state.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueueConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn JobQueue>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .failing_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::MessageQueue("模拟连接失败".to_string()));
        }

        debug!("内存队列连接建立");
        Ok(Box::new(InMemoryJobQueue {
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        "内存队列".to_string()
    }
}

/// 内存队列连接
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Arc<BrokerState>,
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn next_delivery(&mut self) -> Result<Option<JobDelivery>> {
        loop {
            if self.state.severed.swap(false, Ordering::SeqCst) {
                return Err(DispatchError::MessageQueue("连接已中断".to_string()));
            }

            if let Some(payload) = self.state.pending.lock().await.pop_front() {
                let delivery_tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                return Ok(Some(JobDelivery {
                    delivery_tag,
                    payload,
                }));
            }

            self.state.notify.notified().await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.state.acked.lock().await.push(delivery_tag);
        Ok(())
    }

    async fn delete_queue(&self) -> Result<()> {
        self.state.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
