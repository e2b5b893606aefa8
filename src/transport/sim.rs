//! In-memory bench for `--mock` mode and tests.
//!
//! Each simulated device answers `*IDN?`, returns canned responses for query
//! prefixes, and logs every command it receives. Failure injection mirrors what
//! real benches do: devices that never answer, transient read failures, writes
//! that fail for particular commands, and serial devices that only answer at
//! one baud rate.
//!
//! ```
//! use lab_bench::transport::sim::{SimDevice, SimulatedBench};
//! use lab_bench::transport::TransportKind;
//!
//! let bench = SimulatedBench::new();
//! bench.add(
//!     TransportKind::Gpib,
//!     "GPIB0::5::INSTR",
//!     SimDevice::new("HEWLETT-PACKARD,E3631A,0,2.1-5.0-1.0").with_response("MEAS:VOLT?", "5.0"),
//! );
//! assert_eq!(bench.bytes_written(TransportKind::Gpib, "GPIB0::5::INSTR"), 0);
//! ```

use super::{Transport, TransportBackend, TransportError, TransportKind, TransportSettings};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Behaviour and traffic log of one simulated instrument.
#[derive(Debug, Clone)]
pub struct SimDevice {
    idn: Option<String>,
    responsive: bool,
    responses: Vec<(String, String)>,
    default_response: String,
    failing: Vec<String>,
    transient_failures: u32,
    baud_rate: Option<u32>,
    traffic: Vec<String>,
    bytes_written: usize,
    identify_attempts: usize,
    opens: usize,
}

impl SimDevice {
    /// A device answering `*IDN?` with `idn`.
    pub fn new(idn: &str) -> Self {
        Self {
            idn: Some(idn.to_string()),
            responsive: true,
            responses: Vec::new(),
            default_response: "0".to_string(),
            failing: Vec::new(),
            transient_failures: 0,
            baud_rate: None,
            traffic: Vec::new(),
            bytes_written: 0,
            identify_attempts: 0,
            opens: 0,
        }
    }

    /// A device that accepts connections but never answers.
    pub fn silent() -> Self {
        Self {
            idn: None,
            responsive: false,
            ..Self::new("")
        }
    }

    /// A device that answers its own protocol but not `*IDN?`.
    pub fn without_idn() -> Self {
        Self {
            idn: None,
            ..Self::new("")
        }
    }

    /// Answer queries starting with `prefix` (case-insensitive) with `response`.
    pub fn with_response(mut self, prefix: &str, response: &str) -> Self {
        self.responses
            .push((prefix.to_ascii_uppercase(), response.to_string()));
        self
    }

    /// Fail writes and queries starting with `prefix`.
    pub fn failing_on(mut self, prefix: &str) -> Self {
        self.failing.push(prefix.to_ascii_uppercase());
        self
    }

    /// Fail the next `count` queries with a read error.
    pub fn with_transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    /// Only answer when opened at this baud rate.
    pub fn at_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    fn fails(&self, command: &str) -> bool {
        self.failing.iter().any(|prefix| command.starts_with(prefix))
    }

    fn lookup(&self, command: &str) -> Option<&str> {
        self.responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, response)| response.as_str())
    }
}

type DeviceMap = BTreeMap<(TransportKind, String), SimDevice>;

/// A bench of simulated devices serving every transport kind.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    devices: Arc<Mutex<DeviceMap>>,
}

impl SimulatedBench {
    /// Empty bench.
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, DeviceMap> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_device<T>(&self, kind: TransportKind, address: &str, f: impl FnOnce(&SimDevice) -> T) -> Option<T> {
        self.devices().get(&(kind, address.to_string())).map(f)
    }

    /// Connect a device at an address. Replaces any device already there.
    pub fn add(&self, kind: TransportKind, address: &str, device: SimDevice) {
        self.devices().insert((kind, address.to_string()), device);
    }

    /// Disconnect a device.
    pub fn remove(&self, kind: TransportKind, address: &str) {
        self.devices().remove(&(kind, address.to_string()));
    }

    /// Start failing commands with `prefix` on an already connected device.
    pub fn fail_commands(&self, kind: TransportKind, address: &str, prefix: &str) {
        if let Some(device) = self.devices().get_mut(&(kind, address.to_string())) {
            device.failing.push(prefix.to_ascii_uppercase());
        }
    }

    /// Every command the device received, in order.
    pub fn commands(&self, kind: TransportKind, address: &str) -> Vec<String> {
        self.with_device(kind, address, |d| d.traffic.clone())
            .unwrap_or_default()
    }

    /// Bytes sent to the device, terminations included.
    pub fn bytes_written(&self, kind: TransportKind, address: &str) -> usize {
        self.with_device(kind, address, |d| d.bytes_written)
            .unwrap_or_default()
    }

    /// Number of `*IDN?` queries the device received.
    pub fn identify_attempts(&self, kind: TransportKind, address: &str) -> usize {
        self.with_device(kind, address, |d| d.identify_attempts)
            .unwrap_or_default()
    }

    /// Number of times the device was opened.
    pub fn open_count(&self, kind: TransportKind, address: &str) -> usize {
        self.with_device(kind, address, |d| d.opens).unwrap_or_default()
    }

    /// Forget recorded traffic on every device.
    pub fn clear_traffic(&self) {
        for device in self.devices().values_mut() {
            device.traffic.clear();
            device.bytes_written = 0;
        }
    }

    /// A populated bench: two supplies, two generators, a scope and a meter.
    pub fn demo() -> Self {
        let bench = Self::new();
        bench.add(
            TransportKind::UsbTmc,
            "USB0::0x0699::0x03A4::C012345::INSTR",
            SimDevice::new("TEKTRONIX,MSO2024,C012345,CF:91.1CT FV:v1.52")
                .with_response("CURVE?", "0,25,50,25,0,-25,-50,-25")
                .with_response("WFMOUTPRE:XINCR?", "4.0E-7")
                .with_response("WFMOUTPRE:YMULT?", "0.004")
                .with_response("WFMOUTPRE:YOFF?", "0")
                .with_response("WFMOUTPRE:YZERO?", "0"),
        );
        bench.add(
            TransportKind::UsbTmc,
            "USB0::0xF4EC::0xEE38::574B21101::INSTR",
            SimDevice::new("B&K Precision,4063,574B21101,5.01.01.12R5"),
        );
        bench.add(
            TransportKind::Gpib,
            "GPIB0::5::INSTR",
            SimDevice::new("HEWLETT-PACKARD,E3631A,0,2.1-5.0-1.0")
                .with_response("MEAS:VOLT?", "+5.00120000E+00")
                .with_response("MEAS:CURR?", "+1.02000000E-01"),
        );
        bench.add(
            TransportKind::Gpib,
            "GPIB0::22::INSTR",
            SimDevice::new("HEWLETT-PACKARD,34401A,0,11-5-2")
                .with_response("MEAS:", "+1.23456000E+00")
                .with_response("READ?", "+1.23456000E+00"),
        );
        bench.add(
            TransportKind::Serial,
            "/dev/ttyUSB0",
            SimDevice::without_idn()
                .at_baud(115_200)
                .with_response(":R00=", ":r00=6600."),
        );
        bench.add(
            TransportKind::Serial,
            "/dev/ttyUSB1",
            SimDevice::new("MATRIX,MPS-6010H-1C,SN0001,V1.0")
                .at_baud(9600)
                .with_response("MEAS:VOLT?", "12.000")
                .with_response("MEAS:CURR?", "0.250"),
        );
        bench
    }
}

#[async_trait]
impl TransportBackend for SimulatedBench {
    fn name(&self) -> &str {
        "simulated"
    }

    fn supports(&self, _kind: TransportKind) -> bool {
        true
    }

    async fn enumerate(&self, kind: TransportKind) -> Result<Vec<String>, TransportError> {
        Ok(self
            .devices()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, address)| address.clone())
            .collect())
    }

    async fn open(
        &self,
        kind: TransportKind,
        address: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut devices = self.devices();
        let device = devices
            .get_mut(&(kind, address.to_string()))
            .ok_or_else(|| TransportError::OpenFailed {
                address: address.to_string(),
                reason: "no device at this address".to_string(),
            })?;
        device.opens += 1;
        Ok(Box::new(SimTransport {
            bench: self.clone(),
            kind,
            address: address.to_string(),
            settings: settings.clone(),
            closed: false,
        }))
    }
}

/// Transport to one simulated device.
pub struct SimTransport {
    bench: SimulatedBench,
    kind: TransportKind,
    address: String,
    settings: TransportSettings,
    closed: bool,
}

impl SimTransport {
    fn exchange(&self, command: &str, expect_response: bool) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let mut devices = self.bench.devices();
        let device = devices
            .get_mut(&(self.kind, self.address.clone()))
            .ok_or_else(|| TransportError::ReadFailed("device disconnected".to_string()))?;

        let command = command.trim();
        device.traffic.push(command.to_string());
        device.bytes_written += command.len() + self.settings.write_termination.len();
        trace!(address = %self.address, command, "Simulated exchange");

        let normalized = command.to_ascii_uppercase();
        if expect_response && normalized == "*IDN?" {
            device.identify_attempts += 1;
        }
        if expect_response && device.transient_failures > 0 {
            device.transient_failures -= 1;
            return Err(TransportError::ReadFailed("simulated transient failure".to_string()));
        }
        if device.fails(&normalized) {
            return Err(if expect_response {
                TransportError::ReadFailed(format!("simulated failure on '{command}'"))
            } else {
                TransportError::WriteFailed(format!("simulated failure on '{command}'"))
            });
        }
        if !expect_response {
            return Ok(String::new());
        }

        let baud_matches = match (self.kind, device.baud_rate) {
            (TransportKind::Serial, Some(required)) => self.settings.baud_rate == Some(required),
            _ => true,
        };
        if !device.responsive || !baud_matches {
            return Err(TransportError::Timeout(self.settings.timeout));
        }

        if normalized == "*IDN?" {
            return device
                .idn
                .clone()
                .ok_or(TransportError::Timeout(self.settings.timeout));
        }
        if let Some(response) = device.lookup(&normalized) {
            return Ok(response.to_string());
        }
        if normalized.ends_with('?') {
            return Ok(device.default_response.clone());
        }
        Err(TransportError::Timeout(self.settings.timeout))
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.exchange(command, false).map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.exchange(command, true)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}
