pub mod device_pool;
pub mod message_queue;
pub mod result_store;

pub use device_pool::*;
pub use message_queue::*;
pub use result_store::*;
