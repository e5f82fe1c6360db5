pub mod job;
pub mod job_result;

pub use job::{JobDescriptor, MAX_JOB_PAYLOAD_BYTES};
pub use job_result::{
    EpochField, EpochRecord, JobResultRecord, ADDITIONAL_TRAINING_FIELD, CURRENT_EPOCH_FIELD,
    TOTAL_EPOCHS_FIELD,
};
