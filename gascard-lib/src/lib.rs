pub mod codes;
pub mod config;
pub mod constants;
pub mod device;
pub mod discovery;
pub mod error;
pub mod mode;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod transport;

// Re-export the main entry points for easy access
pub use codes::CodeTable;
pub use device::{Gascard, GascardOptions};
pub use error::GascardError;
pub use mode::Mode;
pub use record::{FieldRecord, FieldValue};
pub use registry::{DeviceReading, OpenPort, PortSpec, Registry};
pub use scheduler::{Control, Reply, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerReport, WriteMode};
pub use sink::{CsvSink, MemorySink, SampleBatch, SampleRow, SampleSink, SinkError, SqliteSink};
pub use transport::{FrameChannel, LineConfig, SerialConfig, Terminator};
