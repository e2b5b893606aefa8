//! Instrument Capabilities
//!
//! Instruments declare the capability tags they support and implement the
//! matching traits:
//!
//! - A bench supply implements [`PowerSupply`]
//! - A scope with a built-in generator implements [`Oscilloscope`] and
//!   [`FunctionGenerator`]
//! - A meter implements [`Multimeter`]
//!
//! The interpreter never looks at concrete driver types. It checks the declared
//! [`CapabilityTag`]s and reaches the trait through the accessors on
//! [`Instrument`](crate::hardware::Instrument).
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; drivers serialise transport access internally
//! - Validates bounds before anything reaches the wire
//!
//! # Example
//!
//! ```rust,ignore
//! async fn bring_up(psu: &dyn PowerSupply) -> BenchResult<PowerReading> {
//!     psu.set_voltage("P6V", 5.0).await?;
//!     psu.set_current_limit("P6V", 0.2).await?;
//!     psu.output_on().await?;
//!     psu.measure_actual("P6V").await
//! }
//! ```

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capability families an instrument may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CapabilityTag {
    /// Captures waveforms
    Oscilloscope,
    /// Sources regulated voltage and current
    PowerSupply,
    /// Measures voltage, current, resistance and friends
    Multimeter,
    /// Generates waveforms
    FunctionGenerator,
}

impl CapabilityTag {
    /// Short keyword used on the command line to pick a capability explicitly.
    pub fn keyword(&self) -> &'static str {
        match self {
            CapabilityTag::Oscilloscope => "scope",
            CapabilityTag::PowerSupply => "psu",
            CapabilityTag::Multimeter => "dmm",
            CapabilityTag::FunctionGenerator => "awg",
        }
    }

    /// Resolve a capability keyword (`psu`, `power_supply`, ...).
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "scope" | "oscilloscope" => Some(CapabilityTag::Oscilloscope),
            "psu" | "power_supply" | "supply" => Some(CapabilityTag::PowerSupply),
            "dmm" | "multimeter" | "meter" => Some(CapabilityTag::Multimeter),
            "awg" | "function_generator" | "generator" | "fg" => {
                Some(CapabilityTag::FunctionGenerator)
            }
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityTag::Oscilloscope => "Oscilloscope",
            CapabilityTag::PowerSupply => "PowerSupply",
            CapabilityTag::Multimeter => "Multimeter",
            CapabilityTag::FunctionGenerator => "FunctionGenerator",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Value types
// =============================================================================

/// Voltage and current measured at a supply output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// Measured output voltage
    pub volts: f64,
    /// Measured output current
    pub amps: f64,
}

/// A single meter reading with its unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// What was measured
    pub function: MeasureFunction,
    /// Value in `unit`
    pub value: f64,
    /// Display unit
    pub unit: String,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Captured waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRecord {
    /// Source channel (1-based)
    pub channel: u8,
    /// Sample interval in seconds, when the instrument reports it
    pub x_increment: Option<f64>,
    /// Scaled samples in volts
    pub samples: Vec<f64>,
}

impl WaveformRecord {
    /// Smallest and largest sample.
    pub fn extent(&self) -> Option<(f64, f64)> {
        let mut iter = self.samples.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// Input coupling for a scope channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Coupling {
    Dc,
    Ac,
    Gnd,
}

impl Coupling {
    /// SCPI mnemonic.
    pub fn scpi(&self) -> &'static str {
        match self {
            Coupling::Dc => "DC",
            Coupling::Ac => "AC",
            Coupling::Gnd => "GND",
        }
    }
}

impl FromStr for Coupling {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dc" => Ok(Coupling::Dc),
            "ac" => Ok(Coupling::Ac),
            "gnd" | "ground" => Ok(Coupling::Gnd),
            _ => Err(BenchError::Usage(format!(
                "unknown coupling '{s}' (expected dc, ac or gnd)"
            ))),
        }
    }
}

/// Partial scope configuration; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSettings {
    /// Channel the per-channel settings apply to (defaults to 1)
    pub channel: Option<u8>,
    /// Show or hide the channel
    pub display: Option<bool>,
    /// Volts per division
    pub vertical_scale: Option<f64>,
    /// Seconds per division
    pub horizontal_scale: Option<f64>,
    /// Input coupling
    pub coupling: Option<Coupling>,
    /// Edge trigger level in volts
    pub trigger_level: Option<f64>,
}

impl ScopeSettings {
    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self.display.is_none()
            && self.vertical_scale.is_none()
            && self.horizontal_scale.is_none()
            && self.coupling.is_none()
            && self.trigger_level.is_none()
    }
}

/// Generator waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum WaveShape {
    Sine,
    Square,
    Ramp,
    Triangle,
    Pulse,
    Noise,
    Dc,
}

impl FromStr for WaveShape {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sin" | "sine" => Ok(WaveShape::Sine),
            "squ" | "square" => Ok(WaveShape::Square),
            "ramp" | "saw" | "sawtooth" => Ok(WaveShape::Ramp),
            "tri" | "triangle" => Ok(WaveShape::Triangle),
            "puls" | "pulse" => Ok(WaveShape::Pulse),
            "nois" | "noise" => Ok(WaveShape::Noise),
            "dc" => Ok(WaveShape::Dc),
            _ => Err(BenchError::Usage(format!(
                "unknown waveform '{s}' (expected sine, square, ramp, triangle, pulse, noise or dc)"
            ))),
        }
    }
}

/// Meter measurement functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum MeasureFunction {
    DcVolts,
    AcVolts,
    DcCurrent,
    AcCurrent,
    Resistance,
    FourWireResistance,
    Frequency,
    Period,
    Continuity,
    Diode,
}

impl MeasureFunction {
    /// SCPI function mnemonic.
    pub fn scpi(&self) -> &'static str {
        match self {
            MeasureFunction::DcVolts => "VOLT:DC",
            MeasureFunction::AcVolts => "VOLT:AC",
            MeasureFunction::DcCurrent => "CURR:DC",
            MeasureFunction::AcCurrent => "CURR:AC",
            MeasureFunction::Resistance => "RES",
            MeasureFunction::FourWireResistance => "FRES",
            MeasureFunction::Frequency => "FREQ",
            MeasureFunction::Period => "PER",
            MeasureFunction::Continuity => "CONT",
            MeasureFunction::Diode => "DIOD",
        }
    }

    /// Display unit of readings.
    pub fn unit(&self) -> &'static str {
        match self {
            MeasureFunction::DcVolts | MeasureFunction::AcVolts | MeasureFunction::Diode => "V",
            MeasureFunction::DcCurrent | MeasureFunction::AcCurrent => "A",
            MeasureFunction::Resistance
            | MeasureFunction::FourWireResistance
            | MeasureFunction::Continuity => "Ohm",
            MeasureFunction::Frequency => "Hz",
            MeasureFunction::Period => "s",
        }
    }

    /// Continuity and diode tests take no range or resolution.
    pub fn takes_range(&self) -> bool {
        !matches!(self, MeasureFunction::Continuity | MeasureFunction::Diode)
    }
}

impl FromStr for MeasureFunction {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vdc" | "dcv" | "volt" | "volts" => Ok(MeasureFunction::DcVolts),
            "vac" | "acv" => Ok(MeasureFunction::AcVolts),
            "idc" | "dci" | "curr" | "current" => Ok(MeasureFunction::DcCurrent),
            "iac" | "aci" => Ok(MeasureFunction::AcCurrent),
            "res" | "ohm" | "ohms" => Ok(MeasureFunction::Resistance),
            "fres" | "4w" => Ok(MeasureFunction::FourWireResistance),
            "freq" => Ok(MeasureFunction::Frequency),
            "per" | "period" => Ok(MeasureFunction::Period),
            "cont" | "continuity" => Ok(MeasureFunction::Continuity),
            "diode" | "diod" => Ok(MeasureFunction::Diode),
            _ => Err(BenchError::Usage(format!(
                "unknown measurement '{s}' (expected vdc, vac, idc, iac, res, fres, freq, per, cont or diode)"
            ))),
        }
    }
}

// =============================================================================
// Capability traits
// =============================================================================

/// Capability: Power Supply
///
/// # Contract
/// - `channel` is one of [`channels`](PowerSupply::channels) or a declared alias of one
/// - Out-of-range values fail with `BenchError::Safety` before any command is sent
/// - `output_on`/`output_off` switch every output the supply controls
#[async_trait]
pub trait PowerSupply: Send + Sync {
    /// Declared channel names.
    fn channels(&self) -> Vec<String>;

    /// Set a channel's output voltage.
    async fn set_voltage(&self, channel: &str, volts: f64) -> BenchResult<()>;

    /// Set a channel's current limit.
    async fn set_current_limit(&self, channel: &str, amps: f64) -> BenchResult<()>;

    /// Enable the outputs.
    async fn output_on(&self) -> BenchResult<()>;

    /// Disable the outputs.
    async fn output_off(&self) -> BenchResult<()>;

    /// Measure the actual voltage and current at a channel.
    async fn measure_actual(&self, channel: &str) -> BenchResult<PowerReading>;
}

/// Capability: Oscilloscope
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Number of analog channels.
    fn channel_count(&self) -> u8;

    /// Let the scope pick scales and trigger for the current signals.
    async fn autoset(&self) -> BenchResult<()>;

    /// Read the displayed waveform of a channel.
    async fn acquire(&self, channel: u8) -> BenchResult<WaveformRecord>;

    /// Apply the fields that are set in `settings`.
    async fn configure(&self, settings: &ScopeSettings) -> BenchResult<()>;

    /// Start continuous acquisition.
    async fn run(&self) -> BenchResult<()>;

    /// Stop acquisition.
    async fn stop(&self) -> BenchResult<()>;
}

/// Capability: Multimeter
#[async_trait]
pub trait Multimeter: Send + Sync {
    /// Take one reading. `None` range or resolution lets the meter choose.
    async fn measure(
        &self,
        function: MeasureFunction,
        range: Option<f64>,
        resolution: Option<f64>,
    ) -> BenchResult<Reading>;
}

/// Capability: Function Generator
///
/// # Contract
/// - Channels are 1-based and at most [`channel_count`](FunctionGenerator::channel_count)
/// - Frequency and amplitude outside the declared range fail with
///   `BenchError::Safety` before transmission
#[async_trait]
pub trait FunctionGenerator: Send + Sync {
    /// Number of output channels.
    fn channel_count(&self) -> u8;

    /// Program shape, frequency (Hz), amplitude (Vpp) and offset (V) on a channel.
    async fn set_waveform(
        &self,
        channel: u8,
        shape: WaveShape,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    ) -> BenchResult<()>;

    /// Switch one output.
    async fn set_output(&self, channel: u8, enabled: bool) -> BenchResult<()>;

    /// Switch every output off, trying each one even after a failure.
    async fn outputs_off(&self) -> BenchResult<()>;
}
