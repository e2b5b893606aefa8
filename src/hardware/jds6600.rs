//! Joy-IT JDS6600 DDS generator.
//!
//! Protocol: ASCII register writes `:wNN=DATA.` and reads `:rNN=` over
//! USB-serial at 115200 baud, CR/LF terminated. Writes are not acknowledged.
//! Offsets the register cannot hold are refused rather than clamped.
//!
//! | Register | Channel 1 | Channel 2 | Encoding |
//! |----------|-----------|-----------|----------|
//! | Shape | 21 | 22 | waveform code |
//! | Frequency | 23 | 24 | `value,unit` (0.01 Hz steps, unit 0; 0.01 MHz steps, unit 2) |
//! | Amplitude | 25 | 26 | mV |
//! | Offset | 27 | 28 | `(V + 10) * 100`, 0..=1999 |
//! | Outputs | 20 | 20 | `ch1,ch2` |

use super::capabilities::{CapabilityTag, FunctionGenerator, WaveShape};
use super::link::Link;
use super::registry::ModelDescriptor;
use super::scpi::check_generator_bounds;
use super::{Instrument, InstrumentRecord};
use crate::config::SafetyConfig;
use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Frequencies at or above this use the 0.01 MHz unit to stay within 32 bits.
const HIGH_RANGE_HZ: f64 = 20_000_000.0;

fn shape_code(shape: WaveShape) -> u8 {
    match shape {
        WaveShape::Sine => 0,
        WaveShape::Square => 1,
        WaveShape::Pulse => 2,
        WaveShape::Triangle => 3,
        WaveShape::Dc => 4,
        WaveShape::Noise => 5,
        WaveShape::Ramp => 6,
    }
}

/// Register value and unit code for a frequency.
fn encode_frequency(hz: f64) -> (u64, u8) {
    if hz >= HIGH_RANGE_HZ {
        ((hz / 10_000.0) as u64, 2)
    } else {
        ((hz * 100.0) as u64, 0)
    }
}

/// Offset register range: 0..=1999 in 10 mV steps, biased by 10 V.
const OFFSET_VOLTS: std::ops::RangeInclusive<f64> = -10.0..=9.99;

fn encode_offset(volts: f64) -> u32 {
    ((volts + 10.0) * 100.0).round() as u32
}

/// JDS6600 driver.
pub struct JdsGenerator {
    record: InstrumentRecord,
    descriptor: &'static ModelDescriptor,
    link: Mutex<Link>,
    safety: SafetyConfig,
    // Register 20 sets both outputs at once, so the other channel's state is kept here.
    outputs: Mutex<[bool; 2]>,
    state_known: AtomicBool,
}

impl JdsGenerator {
    pub(crate) fn new(
        record: InstrumentRecord,
        descriptor: &'static ModelDescriptor,
        link: Link,
        safety: SafetyConfig,
    ) -> Self {
        Self {
            record,
            descriptor,
            link: Mutex::new(link),
            safety,
            outputs: Mutex::new([false; 2]),
            state_known: AtomicBool::new(true),
        }
    }

    fn check_channel(&self, channel: u8) -> BenchResult<usize> {
        match channel {
            1 | 2 => Ok(usize::from(channel - 1)),
            _ => Err(BenchError::Usage(format!(
                "generator channel {channel} out of range 1..=2"
            ))),
        }
    }

    async fn write_outputs(&self, state: [bool; 2]) -> BenchResult<()> {
        let command = format!(":w20={},{}.", u8::from(state[0]), u8::from(state[1]));
        self.link.lock().await.write(&command).await
    }
}

#[async_trait]
impl Instrument for JdsGenerator {
    fn record(&self) -> &InstrumentRecord {
        &self.record
    }

    fn state_known(&self) -> bool {
        self.state_known.load(Ordering::SeqCst)
    }

    async fn identify(&self) -> BenchResult<String> {
        let response = self.link.lock().await.query(":r00=").await?;
        Ok(format!("{},{},{response},", self.descriptor.vendor, self.descriptor.model))
    }

    async fn raw(&self, command: &str) -> BenchResult<Option<String>> {
        let command = command.trim();
        let mut link = self.link.lock().await;
        if command.starts_with(":r") || command.ends_with('?') {
            link.query(command).await.map(Some)
        } else {
            link.write(command).await.map(|_| None)
        }
    }

    /// The JDS6600 has no reset command; switching both outputs off is the
    /// closest defined state.
    async fn reset(&self) -> BenchResult<()> {
        self.outputs_off().await?;
        self.state_known.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> BenchResult<()> {
        self.link.lock().await.close().await
    }

    fn as_function_generator(&self) -> Option<&dyn FunctionGenerator> {
        self.record
            .has(CapabilityTag::FunctionGenerator)
            .then_some(self as &dyn FunctionGenerator)
    }
}

#[async_trait]
impl FunctionGenerator for JdsGenerator {
    fn channel_count(&self) -> u8 {
        2
    }

    async fn set_waveform(
        &self,
        channel: u8,
        shape: WaveShape,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    ) -> BenchResult<()> {
        let index = self.check_channel(channel)? as u8;
        let spec = self.descriptor.generator.ok_or_else(|| BenchError::Capability {
            alias: self.record.display_name(),
            verb: "wave".to_string(),
        })?;
        check_generator_bounds(&spec, &self.safety, frequency, amplitude, offset)?;
        if !OFFSET_VOLTS.contains(&offset) {
            return Err(BenchError::Safety(format!(
                "{offset} V offset is outside {}..={} V",
                OFFSET_VOLTS.start(),
                OFFSET_VOLTS.end()
            )));
        }

        let (freq_value, freq_unit) = encode_frequency(frequency);
        let commands = [
            format!(":w{}={}.", 21 + index, shape_code(shape)),
            format!(":w{}={freq_value},{freq_unit}.", 23 + index),
            format!(":w{}={}.", 25 + index, (amplitude * 1000.0) as u32),
            format!(":w{}={}.", 27 + index, encode_offset(offset)),
        ];

        let mut link = self.link.lock().await;
        for command in &commands {
            link.write(command).await?;
        }
        debug!(resource = %link.resource(), channel, ?shape, frequency, amplitude, offset, "Waveform set");
        Ok(())
    }

    async fn set_output(&self, channel: u8, enabled: bool) -> BenchResult<()> {
        let index = self.check_channel(channel)?;
        let mut outputs = self.outputs.lock().await;
        let mut next = *outputs;
        next[index] = enabled;
        self.write_outputs(next).await?;
        *outputs = next;
        Ok(())
    }

    async fn outputs_off(&self) -> BenchResult<()> {
        let mut outputs = self.outputs.lock().await;
        self.write_outputs([false; 2]).await?;
        *outputs = [false; 2];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::error::ErrorKind;
    use crate::hardware::{open_driver, DriverContext, DriverHandle};
    use crate::transport::sim::SimulatedBench;
    use crate::transport::{ResourceLocks, TransportKind};

    const PORT: &str = "/dev/ttyUSB0";

    async fn open(bench: &SimulatedBench) -> DriverHandle {
        let config = BenchConfig::ephemeral();
        let locks = ResourceLocks::new();
        let record = InstrumentRecord::identified(
            TransportKind::Serial,
            PORT,
            "Joy-IT,JDS6600,:r00=6600.,",
            Some(115_200),
        );
        open_driver(
            &record,
            "test",
            DriverContext {
                backend: bench,
                locks: &locks,
                transport: &config.transport,
                safety: &config.safety,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn frequency_switches_units_at_20_mhz() {
        assert_eq!(encode_frequency(1000.0), (100_000, 0));
        assert_eq!(encode_frequency(19_999_999.0), (1_999_999_900, 0));
        assert_eq!(encode_frequency(25_000_000.0), (2500, 2));
    }

    #[test]
    fn offset_is_biased() {
        assert_eq!(encode_offset(0.0), 1000);
        assert_eq!(encode_offset(-10.0), 0);
        assert_eq!(encode_offset(9.99), 1999);
        assert_eq!(encode_offset(-0.07), 993);
    }

    #[tokio::test]
    async fn offset_beyond_register_range_is_refused() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench).await;
        bench.clear_traffic();
        let awg = driver.as_function_generator().unwrap();

        for offset in [12.0, 10.0, -10.5] {
            let err = awg
                .set_waveform(1, WaveShape::Sine, 1000.0, 1.0, offset)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Safety, "{offset}");
        }
        assert!(bench.commands(TransportKind::Serial, PORT).is_empty());

        awg.set_waveform(1, WaveShape::Sine, 1000.0, 1.0, -10.0).await.unwrap();
        assert!(bench
            .commands(TransportKind::Serial, PORT)
            .contains(&":w27=0.".to_string()));
    }

    #[tokio::test]
    async fn programs_channel_two_registers() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench).await;
        let awg = driver.as_function_generator().unwrap();
        awg.set_waveform(2, WaveShape::Triangle, 1000.0, 2.5, 0.5)
            .await
            .unwrap();
        assert_eq!(
            bench.commands(TransportKind::Serial, PORT),
            vec![":w22=3.", ":w24=100000,0.", ":w26=2500.", ":w28=1050."]
        );
    }

    #[tokio::test]
    async fn output_register_keeps_other_channel() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench).await;
        let awg = driver.as_function_generator().unwrap();
        awg.set_output(1, true).await.unwrap();
        awg.set_output(2, true).await.unwrap();
        awg.set_output(1, false).await.unwrap();
        awg.outputs_off().await.unwrap();
        assert_eq!(
            bench.commands(TransportKind::Serial, PORT),
            vec![":w20=1,0.", ":w20=1,1.", ":w20=0,1.", ":w20=0,0."]
        );
        assert!(matches!(awg.set_output(3, true).await, Err(BenchError::Usage(_))));
    }

    #[tokio::test]
    async fn identify_uses_register_read() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench).await;
        assert_eq!(driver.identify().await.unwrap(), "Joy-IT,JDS6600,:r00=6600.,");
        assert!(driver.as_power_supply().is_none());
    }
}
