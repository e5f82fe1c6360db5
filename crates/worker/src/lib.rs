pub mod consumer;
pub mod lease;
pub mod output_parser;
pub mod progress;
pub mod supervisor;

pub use consumer::{ConsumerSettings, JobDispatchConsumer};
pub use lease::{DeviceLease, DeviceLeaser};
pub use output_parser::{parse_line, ClassMetricKind, ParsedLineFact};
pub use progress::ProgressRecorder;
pub use supervisor::{ExecutionOutcome, SubprocessSupervisor};
