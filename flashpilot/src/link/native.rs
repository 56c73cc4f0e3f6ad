//! Native serial link implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        link::{BridgeKind, DetectedPort, DeviceLink},
    },
    log::{debug, trace},
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Default read/write timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Native serial link.
///
/// Created closed; the OS handle only exists between `open` and `close`.
pub struct SerialLink {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl SerialLink {
    /// Create a closed link for the given port name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            port: None,
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the read/write timeout used by subsequent opens.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or(Error::NotOpen)
    }
}

impl DeviceLink for SerialLink {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(port) = self.port.as_mut() {
            trace!("{} already open, switching to {baud_rate} baud", self.name);
            port.set_baud_rate(baud_rate)?;
            return Ok(());
        }

        let port = serialport::new(&self.name, baud_rate)
            .timeout(self.timeout)
            .open()?;
        debug!("Opened {} at {baud_rate} baud", self.name);
        self.port = Some(port);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let port = self.port_mut()?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes it
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Enumerate serial ports with bridge classification.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort::named(port_info.port_name.clone());

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.bridge = BridgeKind::from_vid(usb_info.vid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Bridge: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.bridge
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_link_is_closed() {
        let mut link = SerialLink::new("/dev/does-not-exist");
        assert!(!link.is_open());
        assert_eq!(link.name(), "/dev/does-not-exist");
        assert!(matches!(link.write(b"x"), Err(Error::NotOpen)));
        // Closing a closed link is fine
        assert!(link.close().is_ok());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut link = SerialLink::new("/dev/flashpilot-missing-port");
        assert!(link.open(115200).is_err());
        assert!(!link.is_open());
    }

    #[test]
    fn test_detect_ports_does_not_panic() {
        let _ = detect_ports();
    }
}
