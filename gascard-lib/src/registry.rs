//! Name-keyed collection of Gascards with concurrent fan-out.
//!
//! Every bulk operation launches one future per targeted device and
//! completes once all of them have. Each device is borrowed mutably by
//! exactly one future, so operations on one device stay strictly sequential
//! while different devices proceed independently. Failures are reported per
//! device and never abort the siblings.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::device::{Gascard, GascardOptions, check_span};
use crate::error::GascardError;
use crate::record::{FieldRecord, FieldValue};

/// Either a port to open or a device that is already connected.
pub enum PortSpec<S = SerialStream> {
    Identifier(String),
    Existing(Gascard<S>),
}

impl From<&str> for PortSpec<SerialStream> {
    fn from(port: &str) -> Self {
        PortSpec::Identifier(port.to_string())
    }
}

/// One device's answer to a `get`, bracketed by wall-clock timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub record: FieldRecord,
    pub request_sent: DateTime<Utc>,
    pub response_received: DateTime<Utc>,
}

impl DeviceReading {
    /// Authoritative sample time: halfway between request and response.
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.request_sent + (self.response_received - self.request_sent) / 2
    }
}

pub type Readings = BTreeMap<String, Result<DeviceReading, GascardError>>;
pub type Outcomes = BTreeMap<String, Result<(), GascardError>>;

/// Owns every connected Gascard, keyed by a caller-chosen name.
pub struct Registry<S = SerialStream> {
    devices: BTreeMap<String, Gascard<S>>,
    options: GascardOptions,
}

/// Streams a registry can open from a port identifier.
pub trait OpenPort: Sized {
    fn open_port(port: &str, options: &GascardOptions) -> impl Future<Output = Result<Gascard<Self>, GascardError>>;
}

impl OpenPort for SerialStream {
    fn open_port(port: &str, options: &GascardOptions) -> impl Future<Output = Result<Gascard<Self>, GascardError>> {
        Gascard::connect(port, options)
    }
}

/// In-memory pipes have no name to open; only existing handles can be added.
impl OpenPort for DuplexStream {
    async fn open_port(port: &str, _options: &GascardOptions) -> Result<Gascard<Self>, GascardError> {
        Err(GascardError::DeviceNotFound { port: port.to_string() })
    }
}

impl<S> Registry<S>
where
    S: OpenPort + AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Register a device by port or adopt an existing handle.
    pub async fn add(&mut self, name: &str, spec: PortSpec<S>) -> Result<(), GascardError> {
        if self.devices.contains_key(name) {
            return Err(GascardError::DuplicateName(name.to_string()));
        }
        let device = match spec {
            PortSpec::Identifier(port) => S::open_port(&port, &self.options).await?,
            PortSpec::Existing(device) => device,
        };
        self.adopt(name, device)
    }
}

impl<S> Registry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(options: GascardOptions) -> Self {
        Self {
            devices: BTreeMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &GascardOptions {
        &self.options
    }

    /// Take ownership of a connected device under `name`.
    pub fn adopt(&mut self, name: &str, device: Gascard<S>) -> Result<(), GascardError> {
        if self.devices.contains_key(name) {
            return Err(GascardError::DuplicateName(name.to_string()));
        }
        info!(name, port = device.port(), "Registered Gascard");
        self.devices.insert(name.to_string(), device);
        Ok(())
    }

    /// Close and evict the named devices. Nothing is removed if any name is unknown.
    pub async fn remove<T: AsRef<str>>(&mut self, names: &[T]) -> Result<(), GascardError> {
        self.check_names(names)?;
        for name in names {
            if let Some(mut device) = self.devices.remove(name.as_ref()) {
                if let Err(e) = device.close().await {
                    warn!(name = name.as_ref(), "Error closing device: {}", e);
                }
                info!(name = name.as_ref(), "Removed Gascard");
            }
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn device(&self, name: &str) -> Result<&Gascard<S>, GascardError> {
        self.devices
            .get(name)
            .ok_or_else(|| GascardError::UnknownDevice(name.to_string()))
    }

    pub fn device_info(&self, name: &str) -> Result<&FieldRecord, GascardError> {
        self.device(name).map(Gascard::device_info)
    }

    /// Read `fields` from the targeted devices concurrently.
    ///
    /// `devices = None` targets every registered device. Unknown target names
    /// fail the whole call before any I/O; device errors land in the map.
    pub async fn get<T: AsRef<str>>(&mut self, fields: &[T], devices: Option<&[&str]>) -> Result<Readings, GascardError> {
        let targets = self.targets(devices)?;
        let fields: Vec<&str> = fields.iter().map(AsRef::as_ref).collect();
        debug!(?targets, ?fields, "Fan-out get");

        let tasks = self
            .devices
            .iter_mut()
            .filter(|(name, _)| targets.contains(*name))
            .map(|(name, device)| {
                let fields = &fields;
                async move {
                    let request_sent = Utc::now();
                    let result = device.get(fields.iter()).await;
                    let response_received = Utc::now();
                    let reading = result.map(|record| DeviceReading {
                        record,
                        request_sent,
                        response_received,
                    });
                    if let Err(e) = &reading {
                        warn!(name = %name, "Read failed: {}", e);
                    }
                    (name.clone(), reading)
                }
            });
        Ok(join_all(tasks).await.into_iter().collect())
    }

    /// Write the same assignments to the targeted devices concurrently.
    pub async fn set(
        &mut self,
        assignments: &[(String, FieldValue)],
        devices: Option<&[&str]>,
    ) -> Result<Outcomes, GascardError> {
        let targets = self.targets(devices)?;
        let tasks = self
            .devices
            .iter_mut()
            .filter(|(name, _)| targets.contains(*name))
            .map(|(name, device)| async move {
                let result = device
                    .set(assignments.iter().map(|(field, value)| (field.as_str(), value.clone())))
                    .await;
                (name.clone(), result)
            });
        Ok(collect_outcomes("set", join_all(tasks).await))
    }

    /// Zero every targeted device. Zero gas must be flowing.
    pub async fn zero(&mut self, devices: Option<&[&str]>) -> Result<Outcomes, GascardError> {
        let targets = self.targets(devices)?;
        let tasks = self
            .devices
            .iter_mut()
            .filter(|(name, _)| targets.contains(*name))
            .map(|(name, device)| async move { (name.clone(), device.zero().await) });
        Ok(collect_outcomes("zero", join_all(tasks).await))
    }

    /// Span every targeted device; the fraction is checked before any write.
    pub async fn span(&mut self, fraction: f64, devices: Option<&[&str]>) -> Result<Outcomes, GascardError> {
        check_span(fraction)?;
        let targets = self.targets(devices)?;
        let tasks = self
            .devices
            .iter_mut()
            .filter(|(name, _)| targets.contains(*name))
            .map(|(name, device)| async move { (name.clone(), device.span(fraction).await) });
        Ok(collect_outcomes("span", join_all(tasks).await))
    }

    pub async fn time_constant(
        &mut self,
        seconds: u32,
        devices: Option<&[&str]>,
    ) -> Result<Outcomes, GascardError> {
        let targets = self.targets(devices)?;
        let tasks = self
            .devices
            .iter_mut()
            .filter(|(name, _)| targets.contains(*name))
            .map(|(name, device)| async move { (name.clone(), device.time_constant(seconds).await) });
        Ok(collect_outcomes("time constant", join_all(tasks).await))
    }

    /// Close every device and empty the registry.
    pub async fn close_all(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        for (name, mut device) in devices {
            if let Err(e) = device.close().await {
                warn!(name = %name, "Error closing device: {}", e);
            }
        }
    }

    fn check_names<T: AsRef<str>>(&self, names: &[T]) -> Result<(), GascardError> {
        match names.iter().find(|n| !self.devices.contains_key(n.as_ref())) {
            Some(missing) => Err(GascardError::UnknownDevice(missing.as_ref().to_string())),
            None => Ok(()),
        }
    }

    fn targets(&self, devices: Option<&[&str]>) -> Result<Vec<String>, GascardError> {
        match devices {
            Some(names) => {
                self.check_names(names)?;
                Ok(names.iter().map(|n| n.to_string()).collect())
            }
            None => Ok(self.names()),
        }
    }
}

fn collect_outcomes(operation: &str, results: Vec<(String, Result<(), GascardError>)>) -> Outcomes {
    for (name, result) in &results {
        if let Err(e) = result {
            warn!(name = %name, operation, "Device operation failed: {}", e);
        }
    }
    results.into_iter().collect()
}
