use futures::future::join_all;
use tokio_serial::{SerialPortType, SerialStream};
use tracing::{debug, info};

use crate::device::{Gascard, GascardOptions};
use crate::error::GascardError;

/// Serial ports reported by the operating system, USB adapters first.
pub fn candidate_ports() -> Result<Vec<String>, GascardError> {
    let mut ports = tokio_serial::available_ports()?;
    ports.sort_by_key(|p| !matches!(p.port_type, SerialPortType::UsbPort(_)));
    for port in &ports {
        debug!(port = %port.port_name, kind = ?port.port_type, "Serial port candidate");
    }
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Probe every port concurrently and keep the ones where a Gascard answers.
pub async fn discover(ports: &[String], options: &GascardOptions) -> Vec<Gascard<SerialStream>> {
    let probes = ports.iter().map(|port| async move {
        match Gascard::connect(port, options).await {
            Ok(device) => Some(device),
            Err(e) => {
                debug!(port = %port, "No Gascard: {}", e);
                None
            }
        }
    });
    let found: Vec<_> = join_all(probes).await.into_iter().flatten().collect();
    info!(probed = ports.len(), found = found.len(), "Discovery finished");
    found
}
