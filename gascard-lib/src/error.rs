use crate::mode::Mode;
use std::io;
use thiserror::Error;

/// The primary error type for the `gascard-lib` library.
#[derive(Error, Debug)]
pub enum GascardError {
    #[error("Timeout during serial {0}")]
    Timeout(&'static str),

    #[error("No Gascard answered on {port}")]
    DeviceNotFound { port: String },

    #[error("Device answered in an unexpected mode: expected {expected}, got {token:?}")]
    UnexpectedMode { expected: Mode, token: String },

    #[error("Frame does not belong to mode {expected}: leading token {token:?}")]
    ModeMismatch { expected: Mode, token: String },

    #[error("Frame shape mismatch in mode {mode}: expected {expected} fields, got {actual}")]
    FrameShape {
        mode: Mode,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown field: {0:?}")]
    UnknownField(String),

    #[error("Field {0:?} has no write code")]
    ReadOnlyField(String),

    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Field {field:?} expects a numeric value, got {value:?}")]
    NotNumeric { field: String, value: String },

    #[error("Field {field:?} does not accept {value:?}")]
    NotAccepted { field: String, value: String },

    #[error("A device named {0:?} is already registered")]
    DuplicateName(String),

    #[error("No device named {0:?}")]
    UnknownDevice(String),

    #[error("Code table has no label list for mode {0}")]
    NoLabels(Mode),

    #[error("Serial channel is closed")]
    Closed,

    #[error("Serial stream ended")]
    Disconnected,

    #[error("Non-ASCII data in {0}")]
    Encoding(&'static str),

    #[error("Code table error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GascardError {
    /// Whether the frame on the wire did not match what the engine expected.
    ///
    /// Callers should re-probe the mode or drop the request; the record is
    /// never guess-filled.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            GascardError::UnexpectedMode { .. } | GascardError::ModeMismatch { .. } | GascardError::FrameShape { .. }
        )
    }
}
