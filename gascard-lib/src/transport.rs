//! Framed line channel over a half-duplex byte stream.
//!
//! Every reply from the sensor is one ASCII line. Reads may start in the
//! middle of a line (the device streams continuously), so the channel only
//! hands out lines that begin with a known lead-in token and silently drops
//! leading fragments. Reads and writes are each bounded by the configured
//! timeout; a read timeout means "no data this attempt", not an error.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use crate::constants::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, READ_CHUNK_SIZE};
use crate::error::GascardError;
use crate::mode::Mode;

/// End-of-line marker, device revision dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    #[default]
    CrLf,
    Cr,
    Lf,
}

impl Terminator {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Terminator::CrLf => b"\r\n",
            Terminator::Cr => b"\r",
            Terminator::Lf => b"\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Data bits per byte, 5 to 8.
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub terminator: Terminator,
    /// Per-operation read/write timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            terminator: Terminator::CrLf,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn data_bits(&self) -> Result<tokio_serial::DataBits, GascardError> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(GascardError::Config(format!("unsupported data bits: {other}"))),
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Open a serial port with the given parameters, flow control off.
pub fn open_serial(port: &str, config: &SerialConfig) -> Result<SerialStream, GascardError> {
    debug!(port, baud = config.baud_rate, "Opening serial port");
    let stream = tokio_serial::new(port, config.baud_rate)
        .data_bits(config.data_bits()?)
        .parity(config.parity())
        .stop_bits(config.stop_bits())
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.timeout())
        .open_native_async()?;
    Ok(stream)
}

/// Line framing rules for a channel.
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub terminator: Terminator,
    pub timeout: Duration,
    /// Prefixes that mark the beginning of a genuine frame.
    pub lead_ins: Vec<Vec<u8>>,
}

impl LineConfig {
    /// Framing for Gascard replies: every frame leads with a mode token.
    pub fn gascard(config: &SerialConfig) -> Self {
        Self {
            terminator: config.terminator,
            timeout: config.timeout(),
            lead_ins: Mode::lead_ins(),
        }
    }

    fn is_aligned(&self, frame: &[u8]) -> bool {
        let start = frame.iter().position(|b| *b != 0).unwrap_or(frame.len());
        let frame = &frame[start..];
        self.lead_ins.iter().any(|lead| frame.starts_with(lead))
    }
}

/// A terminator-delimited line channel over an exclusive byte stream.
///
/// At most one read and one write are in flight at a time; callers
/// serialize access per device.
pub struct FrameChannel<S> {
    stream: Option<S>,
    config: LineConfig,
    buffer: BytesMut,
}

impl<S> FrameChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: LineConfig) -> Self {
        Self {
            stream: Some(stream),
            config,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write `command` followed by the terminator.
    ///
    /// Input received before the command is dropped. A write that
    /// does not complete within the timeout fails with [`GascardError::Timeout`].
    pub async fn write(&mut self, command: &str) -> Result<(), GascardError> {
        if !command.is_ascii() {
            return Err(GascardError::Encoding("command"));
        }
        self.discard_input().await?;
        let stream = self.stream.as_mut().ok_or(GascardError::Closed)?;

        let mut data = Vec::with_capacity(command.len() + 2);
        data.extend_from_slice(command.as_bytes());
        data.extend_from_slice(self.config.terminator.as_bytes());
        debug!(bytes = hex::encode(&data), "Serial Write");

        let write = async {
            stream.write_all(&data).await?;
            stream.flush().await
        };
        match timeout(self.config.timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GascardError::Timeout("write")),
        }
    }

    /// Read the next complete frame, terminator stripped.
    ///
    /// Returns `Ok(None)` when an idle wait exceeds the timeout; the partial
    /// frame is discarded so the next call starts clean.
    pub async fn read_line(&mut self) -> Result<Option<String>, GascardError> {
        loop {
            if let Some(frame) = self.take_frame() {
                return frame_text(frame).map(Some);
            }

            let stream = self.stream.as_mut().ok_or(GascardError::Closed)?;
            match timeout(self.config.timeout, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(GascardError::Disconnected),
                Ok(Ok(n)) => trace!(n, "Serial bytes received"),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if !self.buffer.is_empty() {
                        debug!(bytes = hex::encode(&self.buffer), "Discarding partial frame after timeout");
                        self.buffer.clear();
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Keep calling [`read_line`](Self::read_line) until a frame arrives or
    /// `wait` has elapsed.
    ///
    /// A device that streams slower than the idle timeout can leave a gap
    /// longer than one read attempt between frames.
    pub async fn read_line_within(&mut self, wait: Duration) -> Result<Option<String>, GascardError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(line) = self.read_line().await? {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Return the newest complete frame already received, without waiting.
    ///
    /// Older complete frames are dropped. A trailing partial frame stays
    /// buffered for the next read.
    pub async fn latest_line(&mut self) -> Result<Option<String>, GascardError> {
        self.fill_waiting().await?;
        let mut latest = None;
        while let Some(frame) = self.take_frame() {
            if let Some(older) = latest.replace(frame) {
                trace!(bytes = hex::encode(&older), "Skipping superseded frame");
            }
        }
        latest.map(frame_text).transpose()
    }

    /// Drop everything received so far, including bytes already waiting in
    /// the stream. Never waits for new input.
    pub async fn discard_input(&mut self) -> Result<(), GascardError> {
        self.fill_waiting().await?;
        if !self.buffer.is_empty() {
            trace!(bytes = hex::encode(&self.buffer), "Dropping stale input");
            self.buffer.clear();
        }
        Ok(())
    }

    /// Write a command and read the single reply line.
    pub async fn write_then_read_line(&mut self, command: &str) -> Result<Option<String>, GascardError> {
        self.write(command).await?;
        self.read_line().await
    }

    /// Release the underlying stream. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), GascardError> {
        self.buffer.clear();
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing serial channel");
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Move every byte the stream already holds into the buffer.
    async fn fill_waiting(&mut self) -> Result<(), GascardError> {
        let stream = self.stream.as_mut().ok_or(GascardError::Closed)?;
        loop {
            match timeout(Duration::ZERO, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(GascardError::Disconnected),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Pop the first aligned frame out of the buffer, dropping any
    /// fragments that precede it.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let terminator = self.config.terminator.as_bytes();
        while let Some(pos) = find(&self.buffer, terminator) {
            let frame = self.buffer.split_to(pos).to_vec();
            self.buffer.advance(terminator.len());
            if self.config.is_aligned(&frame) {
                return Some(frame);
            }
            debug!(bytes = hex::encode(&frame), "Discarding mid-frame fragment");
        }
        None
    }
}

fn frame_text(frame: Vec<u8>) -> Result<String, GascardError> {
    let text = String::from_utf8(frame).map_err(|_| GascardError::Encoding("frame"))?;
    if !text.is_ascii() {
        return Err(GascardError::Encoding("frame"));
    }
    debug!(line = %text.escape_debug(), "Serial Read");
    Ok(text)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
