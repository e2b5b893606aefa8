//! Instrument drivers and the model registry.
//!
//! - [`capabilities`]: capability tags and the per-capability traits
//! - [`registry`]: identification string to model family
//! - [`scpi`]: template-driven driver for SCPI families and unknown instruments
//! - [`jds6600`]: register-protocol generator driver
//!
//! [`open_driver`] takes a catalog record, claims its resource, opens the
//! transport and returns the matching driver as a [`DriverHandle`].

pub mod capabilities;
pub mod jds6600;
mod link;
pub mod registry;
pub mod scpi;

use crate::config::{SafetyConfig, TransportConfig};
use crate::error::{BenchError, BenchResult};
use crate::transport::{ResourceId, ResourceLocks, TransportBackend, TransportKind, TransportSettings};
use async_trait::async_trait;
use capabilities::{CapabilityTag, FunctionGenerator, Multimeter, Oscilloscope, PowerSupply};
use link::Link;
use registry::{Dialect, ModelDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// One identified instrument in the discovery catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// `<kind>:<address>`
    pub resource_id: ResourceId,
    /// Transport the instrument was found on
    pub transport_kind: TransportKind,
    /// Raw address on that transport
    pub address: String,
    /// Vendor name
    pub vendor: String,
    /// Model name
    pub model: String,
    /// Serial number reported by the instrument
    pub serial_number: String,
    /// Firmware revision reported by the instrument
    pub firmware: String,
    /// Raw identification text
    pub identification: String,
    /// Declared capabilities, empty for unknown models
    pub capabilities: BTreeSet<CapabilityTag>,
    /// Baud rate the instrument answered at (serial only)
    pub baud_rate: Option<u32>,
}

impl InstrumentRecord {
    /// Build a record from an identification response.
    pub fn identified(
        kind: TransportKind,
        address: &str,
        identification: &str,
        baud_rate: Option<u32>,
    ) -> Self {
        let fields = registry::parse_idn(identification);
        let descriptor = registry::resolve(identification);
        let (vendor, model, capabilities) = match descriptor {
            Some(d) => (
                d.vendor.to_string(),
                d.model.to_string(),
                d.capabilities.iter().copied().collect(),
            ),
            None => (fields.vendor.clone(), fields.model.clone(), BTreeSet::new()),
        };
        Self {
            resource_id: ResourceId::new(kind, address),
            transport_kind: kind,
            address: address.to_string(),
            vendor,
            model,
            serial_number: fields.serial_number,
            firmware: fields.firmware,
            identification: identification.trim().to_string(),
            capabilities,
            baud_rate,
        }
    }

    /// Model family, when known.
    pub fn descriptor(&self) -> Option<&'static ModelDescriptor> {
        registry::resolve(&self.identification)
    }

    /// Whether the record declares a capability.
    pub fn has(&self, tag: CapabilityTag) -> bool {
        self.capabilities.contains(&tag)
    }

    /// `vendor model`, or the raw identification when neither is known.
    pub fn display_name(&self) -> String {
        match (self.vendor.is_empty(), self.model.is_empty()) {
            (true, true) => self.identification.clone(),
            (true, false) => self.model.clone(),
            _ => format!("{} {}", self.vendor, self.model),
        }
    }

    /// Capabilities as a comma-separated list.
    pub fn capability_list(&self) -> String {
        if self.capabilities.is_empty() {
            return "none".to_string();
        }
        self.capabilities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Uniform driver surface shared by every instrument.
///
/// Capability-specific operations are reached through the `as_*` accessors,
/// which return `Some` exactly for the capabilities the record declares.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Catalog record this driver was opened for.
    fn record(&self) -> &InstrumentRecord;

    /// Whether the instrument's state is still trusted.
    ///
    /// Cleared when a response could not be interpreted; `reset` restores it.
    fn state_known(&self) -> bool;

    /// Query `*IDN?`.
    async fn identify(&self) -> BenchResult<String>;

    /// Pass a command through. Text ending in `?` is a query and returns its response.
    async fn raw(&self, command: &str) -> BenchResult<Option<String>>;

    /// Return the instrument to its power-on defaults.
    async fn reset(&self) -> BenchResult<()>;

    /// Close the transport and release the resource. Idempotent.
    async fn close(&self) -> BenchResult<()>;

    /// Power supply operations, if declared.
    fn as_power_supply(&self) -> Option<&dyn PowerSupply> {
        None
    }

    /// Oscilloscope operations, if declared.
    fn as_oscilloscope(&self) -> Option<&dyn Oscilloscope> {
        None
    }

    /// Multimeter operations, if declared.
    fn as_multimeter(&self) -> Option<&dyn Multimeter> {
        None
    }

    /// Function generator operations, if declared.
    fn as_function_generator(&self) -> Option<&dyn FunctionGenerator> {
        None
    }
}

/// An open, exclusively owned driver.
pub type DriverHandle = Box<dyn Instrument>;

/// Everything needed to open drivers for catalog records.
#[derive(Clone, Copy)]
pub struct DriverContext<'a> {
    /// Backend used to open transports
    pub backend: &'a dyn TransportBackend,
    /// Process-wide lock table
    pub locks: &'a ResourceLocks,
    /// Per-kind timeouts
    pub transport: &'a TransportConfig,
    /// Bench-wide safety caps
    pub safety: &'a SafetyConfig,
}

/// Claim `record`'s resource for `owner`, open its transport and build its driver.
///
/// Fails with `ResourceBusy` when the resource is already held. The lock is
/// released again if opening or initialising the instrument fails.
pub async fn open_driver(
    record: &InstrumentRecord,
    owner: &str,
    ctx: DriverContext<'_>,
) -> BenchResult<DriverHandle> {
    let lock = ctx.locks.acquire(&record.resource_id, owner)?;
    let descriptor = record.descriptor();
    let timeout = ctx.transport.timeout_for(record.transport_kind);

    let mut settings = TransportSettings::new(timeout)
        .with_write_termination(descriptor.map_or("\n", |d| d.write_termination));
    if record.transport_kind == TransportKind::Serial {
        if let Some(baud) = record.baud_rate.or_else(|| descriptor.and_then(|d| d.serial_baud)) {
            settings = settings.with_baud_rate(baud);
        }
    }

    let transport = ctx
        .backend
        .open(record.transport_kind, &record.address, &settings)
        .await
        .map_err(|e| BenchError::transport(record.resource_id.as_str(), e))?;
    let link = Link::new(transport, lock, timeout);

    let driver: DriverHandle = match descriptor.map(|d| (d, &d.dialect)) {
        Some((d, Dialect::Jds6600)) => Box::new(jds6600::JdsGenerator::new(
            record.clone(),
            d,
            link,
            ctx.safety.clone(),
        )),
        Some((d, Dialect::Scpi(commands))) => {
            let driver = scpi::ScpiInstrument::new(
                record.clone(),
                Some((d, *commands)),
                link,
                ctx.safety.clone(),
            );
            driver.initialize().await?;
            Box::new(driver)
        }
        None => Box::new(scpi::ScpiInstrument::new(
            record.clone(),
            None,
            link,
            ctx.safety.clone(),
        )),
    };

    info!(
        resource = %record.resource_id,
        owner,
        model = %record.display_name(),
        "Driver opened"
    );
    Ok(driver)
}

/// Check a value against an optional bench-wide cap.
pub(crate) fn check_cap(what: &str, value: f64, cap: Option<f64>) -> BenchResult<()> {
    match cap {
        Some(limit) if value.abs() > limit => Err(BenchError::Safety(format!(
            "{what} {value} exceeds the bench limit of {limit}"
        ))),
        _ => Ok(()),
    }
}

/// Reject NaN and infinities before any range check.
pub(crate) fn check_finite(what: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(BenchError::Safety(format!("{what} must be a finite number")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identification_builds_full_record() {
        let record = InstrumentRecord::identified(
            TransportKind::Gpib,
            "GPIB0::5::INSTR",
            "HEWLETT-PACKARD,E3631A,0,2.1-5.0-1.0\n",
            None,
        );
        assert_eq!(record.resource_id.as_str(), "gpib:GPIB0::5::INSTR");
        assert_eq!(record.vendor, "HP");
        assert_eq!(record.model, "E3631A");
        assert_eq!(record.serial_number, "0");
        assert_eq!(record.firmware, "2.1-5.0-1.0");
        assert!(record.has(CapabilityTag::PowerSupply));
        assert_eq!(record.capability_list(), "PowerSupply");
        assert!(record.descriptor().is_some());
    }

    #[test]
    fn unknown_identification_has_no_capabilities() {
        let record = InstrumentRecord::identified(
            TransportKind::UsbTmc,
            "USB0::1::INSTR",
            "ACME,WIDGET-9000,42,1.0",
            None,
        );
        assert!(record.capabilities.is_empty());
        assert_eq!(record.display_name(), "ACME WIDGET-9000");
        assert_eq!(record.capability_list(), "none");
        assert!(record.descriptor().is_none());
    }

    #[test]
    fn caps_and_finiteness() {
        assert!(check_cap("voltage", 5.0, Some(10.0)).is_ok());
        assert!(check_cap("voltage", -12.0, Some(10.0)).is_err());
        assert!(check_cap("voltage", 100.0, None).is_ok());
        assert!(check_finite("voltage", f64::NAN).is_err());
    }
}
