//! Fixed-rate sampling loop over a [`Registry`].
//!
//! The loop runs as its own tokio task and owns the registry for its whole
//! lifetime. Tick `k` is due at `start + k / rate`. Each tick services at
//! most one queued [`Control`] command, reads every targeted device
//! concurrently and hands the resulting batch to a [`SampleSink`]. When the
//! loop falls more than one period behind it skips the missed ticks instead
//! of bursting to catch up.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tokio_serial::SerialStream;
use tracing::{debug, error, info, warn};

use crate::constants::DEFAULT_RATE_HZ;
use crate::error::GascardError;
use crate::record::FieldValue;
use crate::registry::{Outcomes, Readings, Registry};
use crate::sink::{SampleBatch, SampleRow, SampleSink, SinkError};

/// Whether persisting a batch blocks the next fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Persist inline; the next tick waits for the write.
    #[default]
    #[serde(alias = "sync")]
    Synchronous,
    /// Persist on a blocking worker while the next tick is fetched.
    #[serde(alias = "async")]
    Asynchronous,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub rate_hz: f64,
    /// Stop on the first tick at or past this much elapsed time.
    pub duration: Option<Duration>,
    pub write_mode: WriteMode,
    /// Fields sampled each tick; empty means the full Normal record.
    pub fields: Vec<String>,
    /// Devices sampled each tick; `None` means all.
    pub devices: Option<Vec<String>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            duration: None,
            write_mode: WriteMode::default(),
            fields: Vec::new(),
            devices: None,
        }
    }
}

impl SchedulerConfig {
    fn period(&self) -> Result<Duration, GascardError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(GascardError::Config(format!("sampling rate must be positive, got {}", self.rate_hz)));
        }
        Ok(Duration::from_secs_f64(1.0 / self.rate_hz))
    }
}

pub type RegistryFn<S> = Box<dyn FnOnce(&mut Registry<S>) -> Reply + Send>;

/// Commands accepted by a running scheduler.
pub enum Control<S = SerialStream> {
    Stop,
    Get {
        fields: Vec<String>,
        devices: Option<Vec<String>>,
    },
    Set {
        assignments: Vec<(String, FieldValue)>,
        devices: Option<Vec<String>>,
    },
    Zero {
        devices: Option<Vec<String>>,
    },
    Span {
        fraction: f64,
        devices: Option<Vec<String>>,
    },
    TimeConstant {
        seconds: u32,
        devices: Option<Vec<String>>,
    },
    /// Run an arbitrary synchronous callable against the registry.
    Run(RegistryFn<S>),
}

/// Answer to one serviced command.
#[derive(Debug)]
pub enum Reply {
    Readings(Readings),
    Outcomes(Outcomes),
    Custom(Box<dyn Any + Send>),
    Failed(GascardError),
}

/// Final state of a stopped scheduler.
pub struct SchedulerReport<S = SerialStream> {
    pub registry: Registry<S>,
    /// Ticks that ran a fetch.
    pub ticks: u64,
    /// Ticks skipped because the loop fell behind.
    pub skipped: u64,
    /// Per-device read failures across all ticks.
    pub failed_reads: u64,
    /// Failures where the frame on the wire did not match the expected mode or shape.
    pub desyncs: u64,
    /// Fatal persistence error that ended the loop, if any.
    pub error: Option<SinkError>,
}

/// Control side of a running scheduler.
pub struct SchedulerHandle<S = SerialStream> {
    commands: UnboundedSender<Control<S>>,
    replies: UnboundedReceiver<Reply>,
    task: JoinHandle<SchedulerReport<S>>,
}

impl<S> SchedulerHandle<S> {
    /// Queue a command; it is serviced at a tick boundary.
    pub fn send(&self, command: Control<S>) -> Result<(), GascardError> {
        self.commands.send(command).map_err(|_| GascardError::Closed)
    }

    /// Wait for the next reply. `None` once the loop has ended.
    pub async fn reply(&mut self) -> Option<Reply> {
        self.replies.recv().await
    }

    /// Send a command and wait for its reply.
    pub async fn request(&mut self, command: Control<S>) -> Result<Reply, GascardError> {
        self.send(command)?;
        self.reply().await.ok_or(GascardError::Closed)
    }

    /// Ask the loop to end at its next tick.
    pub fn stop(&self) {
        if self.commands.send(Control::Stop).is_err() {
            debug!("Scheduler already stopped");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end and take back the registry.
    pub async fn join(self) -> Result<SchedulerReport<S>, JoinError> {
        self.task.await
    }
}

pub struct Scheduler<S, K> {
    registry: Registry<S>,
    sink: Option<K>,
    config: SchedulerConfig,
    period: Duration,
    commands: UnboundedReceiver<Control<S>>,
    replies: UnboundedSender<Reply>,
    in_flight: Option<JoinHandle<(K, Result<(), SinkError>)>>,
    report: Counters,
}

#[derive(Default)]
struct Counters {
    ticks: u64,
    skipped: u64,
    failed_reads: u64,
    desyncs: u64,
    error: Option<SinkError>,
}

impl<S, K> Scheduler<S, K>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    K: SampleSink + 'static,
{
    /// Spawn the sampling loop on the current runtime.
    pub fn start(registry: Registry<S>, sink: K, config: SchedulerConfig) -> Result<SchedulerHandle<S>, GascardError> {
        let period = config.period()?;
        if let Some(missing) = config.devices.iter().flatten().find(|name| !registry.contains(name)) {
            return Err(GascardError::UnknownDevice(missing.clone()));
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        info!(
            rate_hz = config.rate_hz,
            devices = registry.len(),
            write_mode = ?config.write_mode,
            "Starting sampling scheduler"
        );

        let scheduler = Self {
            registry,
            sink: Some(sink),
            config,
            period,
            commands: command_rx,
            replies: reply_tx,
            in_flight: None,
            report: Counters::default(),
        };
        let task = tokio::spawn(scheduler.run());
        Ok(SchedulerHandle {
            commands: command_tx,
            replies: reply_rx,
            task,
        })
    }

    async fn run(mut self) -> SchedulerReport<S> {
        let start = Instant::now();
        let mut tick: u64 = 0;

        loop {
            let due = start + self.period.mul_f64(tick as f64);
            sleep_until(due).await;
            let now = Instant::now();

            if let Some(limit) = self.config.duration {
                if now.duration_since(start) >= limit {
                    info!(ticks = self.report.ticks, "Sampling duration reached");
                    break;
                }
            }

            let lag = now.duration_since(due).as_secs_f64() / self.period.as_secs_f64();
            if lag > 1.0 {
                let skip = lag.floor() as u64;
                warn!(tick, skip, "Scheduler falling behind, skipping ticks");
                self.report.skipped += skip;
                tick += skip;
            }

            match self.commands.try_recv() {
                Ok(command) => match self.service(command).await {
                    Some(reply) => {
                        if self.replies.send(reply).is_err() {
                            debug!("Reply receiver dropped");
                        }
                    }
                    None => {
                        info!("Stop requested");
                        break;
                    }
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    info!("Scheduler handle dropped, stopping");
                    break;
                }
            }

            let batch = match self.fetch(tick).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Sampling failed: {}", e);
                    break;
                }
            };
            self.report.ticks += 1;

            if !self.persist(batch).await {
                break;
            }
            tick += 1;
        }

        self.finish().await
    }

    async fn fetch(&mut self, tick: u64) -> Result<SampleBatch, GascardError> {
        let devices = name_refs(&self.config.devices);
        let readings = self.registry.get(&self.config.fields, devices.as_deref()).await?;

        let mut rows = Vec::with_capacity(readings.len());
        for (device, result) in readings {
            match result {
                Ok(reading) => rows.push(SampleRow {
                    timestamp: reading.midpoint(),
                    device,
                    request_sent: reading.request_sent,
                    response_received: reading.response_received,
                    record: reading.record,
                }),
                Err(e) => {
                    self.report.failed_reads += 1;
                    if e.is_desync() {
                        self.report.desyncs += 1;
                    }
                    debug!(tick, device = %device, "No sample this tick");
                }
            }
        }
        Ok(SampleBatch { tick, rows })
    }

    /// Returns `false` when the loop must end.
    async fn persist(&mut self, batch: SampleBatch) -> bool {
        if batch.rows.is_empty() {
            debug!(tick = batch.tick, "Empty batch, nothing to persist");
            return true;
        }
        if !self.await_in_flight().await {
            return false;
        }
        let Some(mut sink) = self.sink.take() else {
            return false;
        };

        match self.config.write_mode {
            WriteMode::Synchronous => {
                let result = sink.persist(&batch);
                self.sink = Some(sink);
                self.check(result)
            }
            WriteMode::Asynchronous => {
                self.in_flight = Some(tokio::task::spawn_blocking(move || {
                    let result = sink.persist(&batch);
                    (sink, result)
                }));
                true
            }
        }
    }

    /// Finish the outstanding asynchronous write, if any.
    async fn await_in_flight(&mut self) -> bool {
        let Some(handle) = self.in_flight.take() else {
            return true;
        };
        match handle.await {
            Ok((sink, result)) => {
                self.sink = Some(sink);
                self.check(result)
            }
            Err(e) => {
                error!("Persistence worker failed: {}", e);
                self.report.error = Some(SinkError::Unavailable(format!("persistence worker failed: {e}")));
                false
            }
        }
    }

    fn check(&mut self, result: Result<(), SinkError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                error!("Persistence failed, stopping: {}", e);
                self.report.error = Some(e);
                false
            }
            Err(e) => {
                warn!("Batch not persisted: {}", e);
                true
            }
        }
    }

    /// Run one command against the registry. `None` means stop.
    async fn service(&mut self, command: Control<S>) -> Option<Reply> {
        let registry = &mut self.registry;
        let result = match command {
            Control::Stop => return None,
            Control::Get { fields, devices } => {
                let devices = name_refs(&devices);
                registry.get(&fields, devices.as_deref()).await.map(Reply::Readings)
            }
            Control::Set { assignments, devices } => {
                let devices = name_refs(&devices);
                registry.set(&assignments, devices.as_deref()).await.map(Reply::Outcomes)
            }
            Control::Zero { devices } => {
                let devices = name_refs(&devices);
                registry.zero(devices.as_deref()).await.map(Reply::Outcomes)
            }
            Control::Span { fraction, devices } => {
                let devices = name_refs(&devices);
                registry.span(fraction, devices.as_deref()).await.map(Reply::Outcomes)
            }
            Control::TimeConstant { seconds, devices } => {
                let devices = name_refs(&devices);
                registry.time_constant(seconds, devices.as_deref()).await.map(Reply::Outcomes)
            }
            Control::Run(f) => Ok(f(registry)),
        };
        Some(result.unwrap_or_else(Reply::Failed))
    }

    async fn finish(mut self) -> SchedulerReport<S> {
        self.await_in_flight().await;
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.flush() {
                warn!("Final flush failed: {}", e);
                if self.report.error.is_none() && e.is_fatal() {
                    self.report.error = Some(e);
                }
            }
        }
        info!(
            ticks = self.report.ticks,
            skipped = self.report.skipped,
            failed_reads = self.report.failed_reads,
            "Sampling scheduler stopped"
        );
        SchedulerReport {
            registry: self.registry,
            ticks: self.report.ticks,
            skipped: self.report.skipped,
            failed_reads: self.report.failed_reads,
            desyncs: self.report.desyncs,
            error: self.report.error,
        }
    }
}

fn name_refs(names: &Option<Vec<String>>) -> Option<Vec<&str>> {
    names.as_ref().map(|names| names.iter().map(String::as_str).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mode_names() {
        let mode: WriteMode = serde_yaml::from_str("async").unwrap();
        assert_eq!(mode, WriteMode::Asynchronous);
        let mode: WriteMode = serde_yaml::from_str("synchronous").unwrap();
        assert_eq!(mode, WriteMode::Synchronous);
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let config = SchedulerConfig {
            rate_hz: 0.0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.period(), Err(GascardError::Config(_))));
        assert_eq!(SchedulerConfig::default().period().unwrap(), Duration::from_secs(1));
    }
}
