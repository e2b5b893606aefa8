//! Serial transport backend built on `serialport`.
//!
//! Port I/O is blocking, so every exchange runs on the blocking pool via
//! `spawn_blocking` with the port behind an `Arc<Mutex<..>>`.

use super::{Transport, TransportBackend, TransportError, TransportKind, TransportSettings};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Read poll interval for the underlying port.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Default baud rate when the settings do not name one.
const DEFAULT_BAUD: u32 = 9600;

/// Serves [`TransportKind::Serial`] through the operating system's serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl SerialBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportBackend for SerialBackend {
    fn name(&self) -> &str {
        "serial"
    }

    fn supports(&self, kind: TransportKind) -> bool {
        kind == TransportKind::Serial
    }

    async fn enumerate(&self, kind: TransportKind) -> Result<Vec<String>, TransportError> {
        if kind != TransportKind::Serial {
            return Err(TransportError::Unsupported(kind));
        }
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| TransportError::ReadFailed(format!("enumeration task failed: {e}")))?
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
        names.sort();
        debug!(count = names.len(), "Enumerated serial ports");
        Ok(names)
    }

    async fn open(
        &self,
        kind: TransportKind,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if kind != TransportKind::Serial {
            return Err(TransportError::Unsupported(kind));
        }
        let baud = settings.baud_rate.unwrap_or(DEFAULT_BAUD);
        let path = address.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud).timeout(POLL_TIMEOUT).open()
        })
        .await
        .map_err(|e| TransportError::OpenFailed {
            address: address.to_string(),
            reason: format!("open task failed: {e}"),
        })?
        .map_err(|e| TransportError::OpenFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        debug!(address, baud, "Serial port opened");
        Ok(Box::new(SerialTransport {
            address: address.to_string(),
            port: Some(Arc::new(Mutex::new(port))),
            settings: settings.clone(),
        }))
    }
}

/// One open serial port.
pub struct SerialTransport {
    address: String,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    settings: TransportSettings,
}

impl SerialTransport {
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, TransportError> {
        self.port.clone().ok_or(TransportError::NotConnected)
    }
}

/// Write a command and, when `read` is set, collect bytes until the terminator.
fn exchange(
    port: &mut Box<dyn SerialPort>,
    command: &str,
    settings: &TransportSettings,
    read: bool,
) -> Result<String, TransportError> {
    let line = format!("{command}{}", settings.write_termination);
    trace!(command = %line.escape_default(), "Serial write");
    port.write_all(line.as_bytes())
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
    port.flush()
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

    if !read {
        return Ok(String::new());
    }

    let mut buffer = [0u8; 1024];
    let mut response = String::new();
    let start = Instant::now();
    while start.elapsed() < settings.timeout {
        match port.read(&mut buffer) {
            Ok(n) if n > 0 => {
                response.push_str(&String::from_utf8_lossy(&buffer[..n]));
                if response.contains(settings.read_termination) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
        }
    }

    if !response.contains(settings.read_termination) && response.trim().is_empty() {
        return Err(TransportError::Timeout(settings.timeout));
    }
    trace!(response = %response.escape_default(), "Serial read");
    Ok(response.trim().to_string())
}

#[async_trait]
impl Transport for SerialTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let port = self.port()?;
        let command = command.to_string();
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            exchange(&mut port.blocking_lock(), &command, &settings, false)
        })
        .await
        .map_err(|e| TransportError::WriteFailed(format!("task panicked: {e}")))??;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let port = self.port()?;
        let command = command.to_string();
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            exchange(&mut port.blocking_lock(), &command, &settings, true)
        })
        .await
        .map_err(|e| TransportError::ReadFailed(format!("task panicked: {e}")))?
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the last handle closes the OS port.
        if self.port.take().is_some() {
            debug!(address = %self.address, "Serial port closed");
        }
        Ok(())
    }
}
