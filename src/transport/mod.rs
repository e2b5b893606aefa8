//! Transport layer
//!
//! A transport is an open, text-oriented command/response channel to one
//! instrument. Backends enumerate addresses and open transports for the kinds
//! they serve:
//!
//! - [`serial::SerialBackend`] talks to USB-serial and RS-232 devices (feature
//!   `instrument_serial`).
//! - [`sim::SimulatedBench`] serves every kind from an in-memory bench and
//!   backs `--mock` mode and the test suite.
//!
//! USB-TMC and GPIB are reached through any backend that implements
//! [`TransportBackend`] for them, typically a VISA binding.
//!
//! [`ResourceLocks`] makes transport ownership exclusive within a process.

pub mod locks;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod sim;

pub use locks::{ResourceLock, ResourceLocks};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Physical transport an instrument is reached through.
///
/// The declaration order is the catalog sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// USB test-and-measurement class
    UsbTmc,
    /// IEEE-488 bus
    Gpib,
    /// RS-232 or USB-serial
    Serial,
}

impl TransportKind {
    /// Every kind, in catalog order.
    pub const ALL: [TransportKind; 3] = [TransportKind::UsbTmc, TransportKind::Gpib, TransportKind::Serial];

    /// Stable lowercase name used in resource ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::UsbTmc => "usb_tmc",
            TransportKind::Gpib => "gpib",
            TransportKind::Serial => "serial",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usb_tmc" | "usbtmc" | "usb" => Ok(TransportKind::UsbTmc),
            "gpib" => Ok(TransportKind::Gpib),
            "serial" | "asrl" => Ok(TransportKind::Serial),
            other => Err(format!("unknown transport kind '{other}'")),
        }
    }
}

/// Transport-qualified address, rendered `<kind>:<address>`.
///
/// A pure function of (kind, address), so repeated scans of unchanged hardware
/// produce identical ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Build the id for an address on a transport.
    pub fn new(kind: TransportKind, address: &str) -> Self {
        Self(format!("{kind}:{address}"))
    }

    /// The rendered id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into kind and address.
    pub fn parts(&self) -> Option<(TransportKind, &str)> {
        let (kind, address) = self.0.split_once(':')?;
        Some((kind.parse().ok()?, address))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, address) = s
            .split_once(':')
            .ok_or_else(|| format!("'{s}' is not of the form <kind>:<address>"))?;
        if address.is_empty() {
            return Err(format!("'{s}' has an empty address"));
        }
        Ok(Self::new(kind.parse()?, address))
    }
}

/// Errors raised by transports and backends.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Nothing arrived before the per-operation timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The backend could not open the address.
    #[error("failed to open {address}: {reason}")]
    OpenFailed {
        /// Address that failed to open.
        address: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// Used after `close`.
    #[error("transport is closed")]
    NotConnected,

    /// The backend rejected or truncated a write.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The backend failed mid-read.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// No backend in this build handles the transport kind.
    #[error("no backend serves {0} resources")]
    Unsupported(TransportKind),

    /// Operating system I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line settings used when opening a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    /// Per-operation timeout.
    pub timeout: Duration,
    /// Baud rate for serial transports.
    pub baud_rate: Option<u32>,
    /// Appended to every outgoing command.
    pub write_termination: String,
    /// Marks the end of a response.
    pub read_termination: char,
}

impl TransportSettings {
    /// Settings with the common `\n` termination.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            baud_rate: None,
            write_termination: "\n".to_string(),
            read_termination: '\n',
        }
    }

    /// Set the serial baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    /// Set the outgoing termination.
    pub fn with_write_termination(mut self, termination: &str) -> Self {
        self.write_termination = termination.to_string();
        self
    }
}

/// An open command/response channel to one instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address this transport was opened on.
    fn address(&self) -> &str;

    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Send a command and read one response line.
    async fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Enumerates and opens transports of the kinds it supports.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Whether this backend serves a transport kind.
    fn supports(&self, kind: TransportKind) -> bool;

    /// Raw addresses currently present on a transport.
    async fn enumerate(&self, kind: TransportKind) -> Result<Vec<String>, TransportError>;

    /// Open a transport to one address.
    async fn open(
        &self,
        kind: TransportKind,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Routes each transport kind to the first registered backend that supports it.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn TransportBackend>>,
}

impl BackendSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. Earlier registrations win for shared kinds.
    pub fn with(mut self, backend: Arc<dyn TransportBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Whether no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Kinds served by at least one backend.
    pub fn kinds(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(|kind| self.route(*kind).is_some())
            .collect()
    }

    fn route(&self, kind: TransportKind) -> Option<&Arc<dyn TransportBackend>> {
        self.backends.iter().find(|b| b.supports(kind))
    }
}

#[async_trait]
impl TransportBackend for BackendSet {
    fn name(&self) -> &str {
        "backend-set"
    }

    fn supports(&self, kind: TransportKind) -> bool {
        self.route(kind).is_some()
    }

    async fn enumerate(&self, kind: TransportKind) -> Result<Vec<String>, TransportError> {
        match self.route(kind) {
            Some(backend) => backend.enumerate(kind).await,
            None => Err(TransportError::Unsupported(kind)),
        }
    }

    async fn open(
        &self,
        kind: TransportKind,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match self.route(kind) {
            Some(backend) => backend.open(kind, address, settings).await,
            None => Err(TransportError::Unsupported(kind)),
        }
    }
}
