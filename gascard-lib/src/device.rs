use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::codes::CodeTable;
use crate::constants::{
    DEFAULT_SETTLE_FRAMES, DEFAULT_STREAM_PERIOD_MS, SPAN_FIELD, SPAN_MAX, SPAN_MIN, TIME_CONSTANT_FIELD, ZERO_FIELD,
};
use crate::error::GascardError;
use crate::mode::Mode;
use crate::record::{FieldRecord, FieldValue};
use crate::transport::{FrameChannel, LineConfig, SerialConfig, open_serial};

/// Settings shared by every device a process talks to.
#[derive(Debug, Clone)]
pub struct GascardOptions {
    pub serial: SerialConfig,
    pub catalog: Arc<CodeTable>,
    /// Frames of another mode skipped right after a mode switch.
    pub settle_frames: usize,
    /// Interval between frames the device streams; bounds the wait for a fresh one.
    pub stream_period: Duration,
}

impl Default for GascardOptions {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            catalog: CodeTable::builtin(),
            settle_frames: DEFAULT_SETTLE_FRAMES,
            stream_period: Duration::from_millis(DEFAULT_STREAM_PERIOD_MS),
        }
    }
}

/// Represents a connection to one Gascard sensor.
///
/// The device is a mode-addressed state machine: a mode-select command picks
/// the register page and the device then streams one line per sample in that
/// page's layout. The active mode is remote state, mirrored optimistically in
/// `current_mode`.
pub struct Gascard<S = SerialStream> {
    channel: FrameChannel<S>,
    catalog: Arc<CodeTable>,
    current_mode: Mode,
    device_info: FieldRecord,
    settle_frames: usize,
    stream_period: Duration,
    /// Set by a write, cleared by the next decoded frame.
    written_since_read: bool,
    port: String,
}

impl Gascard<SerialStream> {
    /// Open `port` and perform the User Interface handshake.
    pub async fn connect(port: &str, options: &GascardOptions) -> Result<Self, GascardError> {
        let stream = open_serial(port, &options.serial)?;
        Self::handshake(stream, port, options).await
    }
}

impl<S> Gascard<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Probe an already open stream for a Gascard.
    ///
    /// Sends the `U` command and expects one User Interface frame back, which
    /// becomes the static device info. Fails with `DeviceNotFound` when nothing
    /// answers and `UnexpectedMode` when the answer is not a `U` frame.
    pub async fn handshake(stream: S, port: impl Into<String>, options: &GascardOptions) -> Result<Self, GascardError> {
        let port = port.into();
        let mut channel = FrameChannel::new(stream, LineConfig::gascard(&options.serial));
        info!(port = %port, "Probing for Gascard...");

        let reply = match channel.write_then_read_line(Mode::UserInterface.code()).await {
            Ok(reply) => reply,
            Err(GascardError::Timeout(_)) => None,
            Err(e) => return Err(e),
        };
        let Some(line) = reply else {
            return Err(GascardError::DeviceNotFound { port });
        };

        let cleaned = line.replace('\0', "");
        let lead = cleaned.split_whitespace().next().unwrap_or_default();
        if !Mode::UserInterface.matches_token(lead) {
            return Err(GascardError::UnexpectedMode {
                expected: Mode::UserInterface,
                token: lead.to_string(),
            });
        }
        let device_info = FieldRecord::decode(Mode::UserInterface, options.catalog.labels(Mode::UserInterface)?, &cleaned)?;
        options.catalog.check_record(&device_info)?;
        info!(port = %port, info = ?device_info, "Gascard found");

        Ok(Self {
            channel,
            catalog: Arc::clone(&options.catalog),
            current_mode: Mode::UserInterface,
            device_info,
            settle_frames: options.settle_frames,
            stream_period: options.stream_period,
            written_since_read: false,
            port,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn current_mode(&self) -> Mode {
        self.current_mode
    }

    /// User Interface record captured during the handshake.
    pub fn device_info(&self) -> &FieldRecord {
        &self.device_info
    }

    pub fn catalog(&self) -> &Arc<CodeTable> {
        &self.catalog
    }

    /// Send the mode-select command and record the new mode.
    pub async fn select_mode(&mut self, mode: Mode) -> Result<(), GascardError> {
        debug!(port = %self.port, from = %self.current_mode, to = %mode, "Selecting mode");
        self.channel.write(mode.code()).await?;
        self.current_mode = mode;
        self.written_since_read = true;
        Ok(())
    }

    /// Read and decode one frame of `mode`, switching to it first if needed.
    pub async fn read_mode(&mut self, mode: Mode) -> Result<FieldRecord, GascardError> {
        let catalog = Arc::clone(&self.catalog);
        let labels = catalog.labels(mode)?;

        let mut settle = 0;
        let mut pending = None;
        if self.current_mode != mode {
            self.select_mode(mode).await?;
            settle = self.settle_frames;
        } else if self.written_since_read {
            // Buffered frames may predate the write.
            self.channel.discard_input().await?;
        } else {
            pending = self.channel.latest_line().await?;
        }

        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => self
                    .channel
                    .read_line_within(self.stream_period)
                    .await?
                    .ok_or(GascardError::Timeout("read"))?,
            };
            match FieldRecord::decode(mode, labels, &line) {
                Err(GascardError::ModeMismatch { token, .. }) if settle > 0 && Mode::identify(&token).is_some() => {
                    debug!(port = %self.port, token = %token, "Skipping frame sent before the mode switch");
                    settle -= 1;
                }
                Err(GascardError::ModeMismatch { expected, token }) => {
                    if let Some(actual) = Mode::identify(&token) {
                        warn!(port = %self.port, expected = %expected, actual = %actual, "Device is in another mode");
                        self.current_mode = actual;
                    }
                    return Err(GascardError::ModeMismatch { expected, token });
                }
                Ok(record) => {
                    self.written_since_read = false;
                    self.catalog.check_record(&record)?;
                    return Ok(record);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read whichever frame arrives next and adopt its mode as current.
    pub async fn resync_mode(&mut self) -> Result<Mode, GascardError> {
        let line = self.channel.read_line_within(self.stream_period).await?.ok_or(GascardError::Timeout("read"))?;
        let cleaned = line.replace('\0', "");
        let token = cleaned.split_whitespace().next().unwrap_or_default();
        let mode = Mode::identify(token).ok_or_else(|| GascardError::ModeMismatch {
            expected: self.current_mode,
            token: token.to_string(),
        })?;
        self.current_mode = mode;
        Ok(mode)
    }

    /// Read the named fields.
    ///
    /// No names means the full Normal-mode record. Otherwise each distinct
    /// mode touched by the request is read exactly once and the requested
    /// values are returned in request order.
    pub async fn get<I, T>(&mut self, fields: I) -> Result<FieldRecord, GascardError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let names: Vec<String> = fields.into_iter().map(|f| f.as_ref().to_string()).collect();
        if names.is_empty() {
            return self.read_mode(Mode::Normal).await;
        }

        let catalog = Arc::clone(&self.catalog);
        let groups = catalog.group_by_mode(names.iter().map(String::as_str))?;

        let mut values = FieldRecord::new();
        for (mode, members) in groups {
            let record = self.read_mode(mode).await?;
            for name in members {
                if let Some(value) = record.get(name) {
                    values.insert(name, value.clone());
                }
            }
        }

        Ok(names
            .iter()
            .filter_map(|name| values.get(name).map(|v| (name.clone(), v.clone())))
            .collect())
    }

    /// Write field assignments.
    ///
    /// Every name, write code and bound is checked before anything is sent.
    /// Fields are grouped by mode; each mode is selected once and one line is
    /// written per field. Nothing is read back.
    pub async fn set<I, K, V>(&mut self, assignments: I) -> Result<(), GascardError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<FieldValue>,
    {
        let mut plan: Vec<(Mode, Vec<String>)> = Vec::new();
        for (name, value) in assignments {
            let spec = self.catalog.field(name.as_ref())?;
            let command = spec.command(&value.into())?;
            match plan.iter_mut().find(|(mode, _)| *mode == spec.mode) {
                Some((_, commands)) => commands.push(command),
                None => plan.push((spec.mode, vec![command])),
            }
        }

        for (mode, commands) in plan {
            if self.current_mode != mode {
                self.select_mode(mode).await?;
            }
            for command in commands {
                info!(port = %self.port, mode = %mode, command = %command, "Writing setting");
                self.channel.write(&command).await?;
                self.written_since_read = true;
            }
        }
        Ok(())
    }

    /// Set the zero reference.
    ///
    /// The device must already be flowing zero gas.
    pub async fn zero(&mut self) -> Result<(), GascardError> {
        self.set([(ZERO_FIELD, "")]).await
    }

    /// Set the span reference as a fraction of full scale (0.5 to 1.2).
    ///
    /// The device must already be flowing span gas.
    pub async fn span(&mut self, fraction: f64) -> Result<(), GascardError> {
        check_span(fraction)?;
        self.set([(SPAN_FIELD, fraction)]).await
    }

    /// Set the RC filter time constant in seconds.
    pub async fn time_constant(&mut self, seconds: u32) -> Result<(), GascardError> {
        self.set([(TIME_CONSTANT_FIELD, seconds)]).await
    }

    /// Close the underlying channel.
    pub async fn close(&mut self) -> Result<(), GascardError> {
        info!(port = %self.port, "Closing Gascard");
        self.channel.close().await
    }
}

pub(crate) fn check_span(fraction: f64) -> Result<(), GascardError> {
    if (SPAN_MIN..=SPAN_MAX).contains(&fraction) {
        Ok(())
    } else {
        Err(GascardError::OutOfRange {
            field: SPAN_FIELD.to_string(),
            value: fraction,
            min: SPAN_MIN,
            max: SPAN_MAX,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_bounds() {
        assert!(check_span(0.5).is_ok());
        assert!(check_span(1.2).is_ok());
        assert!(check_span(0.8).is_ok());
        assert!(matches!(check_span(0.49), Err(GascardError::OutOfRange { .. })));
        assert!(matches!(check_span(1.21), Err(GascardError::OutOfRange { .. })));
        assert!(check_span(f64::NAN).is_err());
    }
}
