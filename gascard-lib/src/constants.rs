// Protocol and pacing constants for the Gascard

/// Factory baud rate of the serial interface
pub const DEFAULT_BAUD_RATE: u32 = 57_600;

/// Per-operation serial timeout (ms)
pub const DEFAULT_TIMEOUT_MS: u64 = 150;

/// Interval between streamed frames (ms); the device streams at about 4 Hz
pub const DEFAULT_STREAM_PERIOD_MS: u64 = 250;

/// Bytes requested per serial read
pub const READ_CHUNK_SIZE: usize = 256;

/// Frames of another mode tolerated right after a mode switch
pub const DEFAULT_SETTLE_FRAMES: usize = 1;

/// Lower bound of the span gas fraction of full scale
pub const SPAN_MIN: f64 = 0.5;

/// Upper bound of the span gas fraction of full scale
pub const SPAN_MAX: f64 = 1.2;

/// Catalog name of the zero calibration field
pub const ZERO_FIELD: &str = "Zero Gas Corr Factor";

/// Catalog name of the span calibration field
pub const SPAN_FIELD: &str = "Span Gas Corr Factor";

/// Catalog name of the RC filter time constant
pub const TIME_CONSTANT_FIELD: &str = "Time Constant";

/// Default sampling rate of the logger (Hz)
pub const DEFAULT_RATE_HZ: f64 = 1.0;
