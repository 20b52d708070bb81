use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, SerialStream, StopBits,
};

use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// A serial endpoint. USB adapters are identified by vendor/product/serial
/// so they are found again after the kernel renumbers the device node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb: Option<UsbId>,
}

impl Endpoint {
    pub fn new(port: impl Into<String>) -> Self {
        Self { port: port.into(), usb: None }
    }

    pub fn same_device(&self, other: &Endpoint) -> bool {
        match (&self.usb, &other.usb) {
            (Some(a), Some(b)) => a == b,
            _ => self.port == other.port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.usb {
            Some(u) => write!(f, "{} [{:04x}:{:04x}]", self.port, u.vid, u.pid),
            None => f.write_str(&self.port),
        }
    }
}

/// Opens byte streams to endpoints. The connection manager only talks to
/// hardware through this seam.
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Endpoints usable right now without asking the operator.
    fn granted(&self) -> Result<Vec<Endpoint>, LinkError>;

    fn open(&mut self, endpoint: &Endpoint) -> Result<Self::Stream, LinkError>;
}

/// Serial ports at a fixed rate, 8N1, no flow control.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    baud: u32,
}

impl SerialConnector {
    pub fn new(baud: u32) -> Self {
        Self { baud }
    }
}

impl Connector for SerialConnector {
    type Stream = SerialStream;

    fn granted(&self) -> Result<Vec<Endpoint>, LinkError> {
        let ports = tokio_serial::available_ports().map_err(|e| LinkError::Enumerate(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| Endpoint {
                usb: match p.port_type {
                    SerialPortType::UsbPort(info) => Some(UsbId {
                        vid: info.vid,
                        pid: info.pid,
                        serial_number: info.serial_number,
                    }),
                    _ => None,
                },
                port: p.port_name,
            })
            .collect())
    }

    fn open(&mut self, endpoint: &Endpoint) -> Result<SerialStream, LinkError> {
        tokio_serial::new(endpoint.port.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Open { port: endpoint.port.clone(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(port: &str, serial: &str) -> Endpoint {
        Endpoint {
            port: port.into(),
            usb: Some(UsbId { vid: 0x10c4, pid: 0xea60, serial_number: Some(serial.into()) }),
        }
    }

    #[test]
    fn usb_identity_survives_renumbering() {
        assert!(usb("/dev/ttyUSB0", "A1").same_device(&usb("/dev/ttyUSB3", "A1")));
        assert!(!usb("/dev/ttyUSB0", "A1").same_device(&usb("/dev/ttyUSB0", "B2")));
    }

    #[test]
    fn plain_ports_compare_by_path() {
        assert!(Endpoint::new("/dev/ttyAMA0").same_device(&Endpoint::new("/dev/ttyAMA0")));
        assert!(!Endpoint::new("/dev/ttyAMA0").same_device(&usb("/dev/ttyUSB0", "A1")));
    }

    #[test]
    fn display_includes_usb_ids() {
        assert_eq!(usb("/dev/ttyUSB0", "A1").to_string(), "/dev/ttyUSB0 [10c4:ea60]");
    }
}
