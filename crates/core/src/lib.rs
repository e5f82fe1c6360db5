pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use models::{
    EpochField, EpochRecord, JobDescriptor, JobResultRecord, ADDITIONAL_TRAINING_FIELD,
    CURRENT_EPOCH_FIELD, MAX_JOB_PAYLOAD_BYTES, TOTAL_EPOCHS_FIELD,
};
pub use traits::{DevicePool, JobDelivery, JobQueue, JobQueueConnector, ResultStore};
