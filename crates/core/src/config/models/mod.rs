pub mod app_config;
pub mod message_queue;
pub mod observability;
pub mod worker;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use message_queue::{default_queue_name, MessageQueueConfig, RedisConfig};
pub use observability::ObservabilityConfig;
pub use worker::WorkerConfig;
