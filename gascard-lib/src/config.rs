//! Logger configuration file.
//!
//! ```yaml
//! devices:
//!   cell_a: /dev/ttyUSB0
//!   cell_b: /dev/ttyUSB1
//! serial:
//!   baud_rate: 57600
//!   terminator: crlf
//! rate_hz: 2.0
//! duration_s: 3600
//! fields: [Conc 1, Sensor Temp, Pressure]
//! write_mode: async
//! output:
//!   kind: sqlite
//!   path: samples.sqlite
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codes::CodeTable;
use crate::constants::{DEFAULT_RATE_HZ, DEFAULT_SETTLE_FRAMES, DEFAULT_STREAM_PERIOD_MS};
use crate::device::GascardOptions;
use crate::error::GascardError;
use crate::scheduler::{SchedulerConfig, WriteMode};
use crate::sink::{CsvSink, SampleSink, SinkError, SqliteSink};
use crate::transport::SerialConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Sqlite,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub kind: OutputKind,
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            kind: OutputKind::Sqlite,
            path: PathBuf::from("gascard.sqlite"),
        }
    }
}

impl OutputConfig {
    pub fn open(&self) -> Result<Box<dyn SampleSink>, SinkError> {
        let sink: Box<dyn SampleSink> = match self.kind {
            OutputKind::Sqlite => Box::new(SqliteSink::open(&self.path)?),
            OutputKind::Csv => Box::new(CsvSink::create(&self.path)?),
        };
        Ok(sink)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Device name to serial port.
    pub devices: BTreeMap<String, String>,
    pub serial: SerialConfig,
    pub rate_hz: f64,
    pub duration_s: Option<f64>,
    pub fields: Vec<String>,
    pub write_mode: WriteMode,
    pub output: OutputConfig,
    /// Replacement field catalog (JSON).
    pub catalog: Option<PathBuf>,
    pub settle_frames: usize,
    /// Interval between frames the sensors stream, in milliseconds.
    pub stream_period_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            serial: SerialConfig::default(),
            rate_hz: DEFAULT_RATE_HZ,
            duration_s: None,
            fields: Vec::new(),
            write_mode: WriteMode::default(),
            output: OutputConfig::default(),
            catalog: None,
            settle_frames: DEFAULT_SETTLE_FRAMES,
            stream_period_ms: DEFAULT_STREAM_PERIOD_MS,
        }
    }
}

impl LoggerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GascardError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Loading logger config");
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, GascardError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GascardError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(GascardError::Config(format!("rate_hz must be positive, got {}", self.rate_hz)));
        }
        if let Some(d) = self.duration_s {
            if !(d.is_finite() && d >= 0.0) {
                return Err(GascardError::Config(format!("duration_s must be non-negative, got {d}")));
            }
        }
        Ok(())
    }

    /// Device options, loading the replacement catalog if one is configured.
    pub fn gascard_options(&self) -> Result<GascardOptions, GascardError> {
        let catalog = match &self.catalog {
            Some(path) => Arc::new(CodeTable::from_path(path)?),
            None => CodeTable::builtin(),
        };
        let catalog_fields: Vec<&str> = self.fields.iter().map(String::as_str).collect();
        catalog.group_by_mode(catalog_fields)?;
        Ok(GascardOptions {
            serial: self.serial.clone(),
            catalog,
            settle_frames: self.settle_frames,
            stream_period: Duration::from_millis(self.stream_period_ms),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            rate_hz: self.rate_hz,
            duration: self.duration_s.map(Duration::from_secs_f64),
            write_mode: self.write_mode,
            fields: self.fields.clone(),
            devices: None,
        }
    }
}
