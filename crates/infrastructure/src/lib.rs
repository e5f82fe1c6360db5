pub mod device_discovery;
pub mod in_memory;
pub mod message_queue;
pub mod redis_store;

pub use device_discovery::{discover_devices, parse_device_indices};
pub use in_memory::{InMemoryBroker, InMemoryDevicePool, InMemoryJobQueue, InMemoryResultStore};
pub use message_queue::{RabbitMqConnector, RabbitMqJobQueue};
pub use redis_store::{RedisConnectionManager, RedisDevicePool, RedisResultStore};
