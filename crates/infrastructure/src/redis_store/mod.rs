//! Redis上的共享状态: 设备池和任务结果

pub mod connection_manager;
pub mod device_pool;
pub mod result_store;

pub use connection_manager::RedisConnectionManager;
pub use device_pool::RedisDevicePool;
pub use result_store::RedisResultStore;
