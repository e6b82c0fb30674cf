//! Serial port link backed by the `serialport` crate

use super::link_trait::{LinkConnector, SerialLink};
use crate::config::SerialConfig;
use crate::error::{Result, SessionError};
use serde::Serialize;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, BufRead, BufReader, Write};

/// An open serial port
///
/// Reads go through a buffered clone of the port handle; writes go straight
/// to the original handle. Bytes of a line cut off by the read timeout are
/// kept and completed by the next read.
pub struct SerialPortLink {
    name: String,
    writer: Box<dyn SerialPort>,
    reader: BufReader<Box<dyn SerialPort>>,
    partial: Vec<u8>,
}

impl SerialPortLink {
    /// Open the configured port at its baud rate with its read timeout
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout())
            .open()
            .map_err(|e| {
                SessionError::Connection(format!("Failed to open {}: {}", config.port, e))
            })?;
        let reader = port.try_clone().map_err(|e| {
            SessionError::Connection(format!("Failed to clone handle for {}: {}", config.port, e))
        })?;

        tracing::info!(
            "Opened serial port {} at {} baud",
            config.port,
            config.baud_rate
        );

        Ok(Self {
            name: config.port.clone(),
            writer: port,
            reader: BufReader::new(reader),
            partial: Vec::new(),
        })
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        read_line_resumable(&mut self.reader, &mut self.partial)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.partial.clear();
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        self.writer.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::debug!("Flush on close of {} failed: {}", self.name, e);
        }
        tracing::info!("Closed serial port {}", self.name);
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}

/// Read up to a newline, carrying bytes over from an interrupted read
///
/// On a timeout the bytes read so far stay in `partial`.
fn read_line_resumable<R: BufRead>(reader: &mut R, partial: &mut Vec<u8>) -> Result<String> {
    let read = reader.read_until(b'\n', partial)?;
    if read == 0 || partial.last() != Some(&b'\n') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed").into());
    }
    let line = String::from_utf8_lossy(partial).into_owned();
    partial.clear();
    Ok(line)
}

/// Connector that opens real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortConnector;

impl LinkConnector for SerialPortConnector {
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(SerialPortLink::open(config)?))
    }
}

/// A serial port visible on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn from_serialport(info: serialport::SerialPortInfo) -> Self {
        let mut port = Self {
            name: info.port_name,
            kind: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                port.kind = format!("USB {:04x}:{:04x}", usb.vid, usb.pid);
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial_number = usb.serial_number;
            }
            SerialPortType::PciPort => port.kind = "PCI".to_string(),
            SerialPortType::BluetoothPort => port.kind = "Bluetooth".to_string(),
            SerialPortType::Unknown => port.kind = "Unknown".to_string(),
        }
        port
    }
}

/// Enumerate serial ports
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| SessionError::Connection(format!("Failed to enumerate ports: {}", e)))?;
    Ok(ports.into_iter().map(PortInfo::from_serialport).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Read;

    /// Reader that hands out scripted chunks, erroring where a chunk is `None`
    struct ChunkedReader(VecDeque<Option<&'static [u8]>>);

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_line_split_by_timeout_is_reassembled() {
        let mut reader = BufReader::new(ChunkedReader(VecDeque::from([
            Some(&b"12.5,30.1,45"[..]),
            None,
            Some(&b"0,20,2,19,18,5,000\n"[..]),
            Some(&b"ok\n"[..]),
        ])));
        let mut partial = Vec::new();

        let err = read_line_resumable(&mut reader, &mut partial).unwrap_err();
        assert!(err.is_link_failure());
        assert_eq!(partial, b"12.5,30.1,45");

        let line = read_line_resumable(&mut reader, &mut partial).unwrap();
        assert_eq!(line, "12.5,30.1,450,20,2,19,18,5,000\n");
        assert!(partial.is_empty());
        assert_eq!(read_line_resumable(&mut reader, &mut partial).unwrap(), "ok\n");
    }

    #[test]
    fn test_closed_port_is_eof() {
        let mut reader = BufReader::new(ChunkedReader(VecDeque::from([Some(&b"12.5"[..])])));
        let mut partial = Vec::new();
        let err = read_line_resumable(&mut reader, &mut partial).unwrap_err();
        assert!(matches!(err, SessionError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let config = SerialConfig {
            port: "/dev/does-not-exist-ventilator".to_string(),
            ..Default::default()
        };
        let result = SerialPortConnector.open(&config);
        assert!(matches!(result, Err(SessionError::Connection(_))));
    }

    #[test]
    fn test_port_info_from_usb() {
        let info = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x2341,
                pid: 0x0042,
                serial_number: Some("7573".to_string()),
                manufacturer: Some("Arduino".to_string()),
                product: None,
            }),
        };
        let port = PortInfo::from_serialport(info);
        assert_eq!(port.kind, "USB 2341:0042");
        assert_eq!(port.manufacturer.as_deref(), Some("Arduino"));
    }
}
