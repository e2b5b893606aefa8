//! Generic SCPI driver.
//!
//! One driver type serves every SCPI family in the registry. Each capability
//! method renders the family's command templates with `strfmt` and sends them
//! over the exclusive [`Link`]. Instruments with no registry match get the same
//! driver with no family, which leaves only the uniform operations (`idn`,
//! `raw`, `reset`).
//!
//! Bounds are checked before the link is touched, so a rejected value never
//! produces traffic.

use super::capabilities::{
    CapabilityTag, FunctionGenerator, MeasureFunction, Multimeter, Oscilloscope, PowerReading,
    PowerSupply, Reading, ScopeSettings, WaveShape, WaveformRecord,
};
use super::link::Link;
use super::registry::{
    ChannelSpec, GeneratorCommands, GeneratorSpec, MeterCommands, ModelDescriptor, ScopeCommands,
    ScpiCommands, SupplyCommands,
};
use super::{check_cap, check_finite, Instrument, InstrumentRecord};
use crate::config::SafetyConfig;
use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use strfmt::strfmt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Render a command template.
fn render(template: &str, vars: &[(&str, String)]) -> BenchResult<String> {
    let mut fmt_context = HashMap::new();
    for (key, value) in vars {
        fmt_context.insert((*key).to_string(), value.clone());
    }
    strfmt(template, &fmt_context)
        .map_err(|e| BenchError::Config(format!("failed to format command '{template}': {e}")))
}

fn on_off(enabled: bool) -> String {
    let state = if enabled { "ON" } else { "OFF" };
    state.to_string()
}

/// Strip an IEEE-488.2 definite-length block header (`#<n><n digits>`), if present.
fn strip_block_header(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix('#') else {
        return trimmed;
    };
    match rest.chars().next().and_then(|c| c.to_digit(10)) {
        Some(width) => rest.get(1 + width as usize..).unwrap_or(""),
        None => trimmed,
    }
}

/// SCPI instrument driver, optionally bound to a registry family.
pub struct ScpiInstrument {
    record: InstrumentRecord,
    family: Option<(&'static ModelDescriptor, &'static ScpiCommands)>,
    link: Mutex<Link>,
    safety: SafetyConfig,
    state_known: AtomicBool,
}

impl ScpiInstrument {
    pub(crate) fn new(
        record: InstrumentRecord,
        family: Option<(&'static ModelDescriptor, &'static ScpiCommands)>,
        link: Link,
        safety: SafetyConfig,
    ) -> Self {
        Self {
            record,
            family,
            link: Mutex::new(link),
            safety,
            state_known: AtomicBool::new(true),
        }
    }

    /// Send the family's post-open commands (remote mode and similar).
    pub(crate) async fn initialize(&self) -> BenchResult<()> {
        let Some((_, commands)) = self.family else {
            return Ok(());
        };
        let mut link = self.link.lock().await;
        for command in commands.init {
            link.write(command).await?;
        }
        Ok(())
    }

    fn resource(&self) -> &str {
        self.record.resource_id.as_str()
    }

    fn supply(&self) -> Option<(&'static ModelDescriptor, &'static SupplyCommands)> {
        let (descriptor, commands) = self.family?;
        Some((descriptor, commands.supply.as_ref()?))
    }

    fn generator(&self) -> Option<(GeneratorSpec, &'static GeneratorCommands)> {
        let (descriptor, commands) = self.family?;
        Some((descriptor.generator?, commands.generator.as_ref()?))
    }

    fn scope(&self) -> Option<(&'static ModelDescriptor, &'static ScopeCommands)> {
        let (descriptor, commands) = self.family?;
        Some((descriptor, commands.scope.as_ref()?))
    }

    fn meter(&self) -> Option<&'static MeterCommands> {
        self.family?.1.meter.as_ref()
    }

    fn capability_missing(&self, verb: &str) -> BenchError {
        BenchError::Capability {
            alias: self.record.display_name(),
            verb: verb.to_string(),
        }
    }

    /// Parse a numeric response; an unreadable one leaves the instrument state unknown.
    fn parse_number(&self, command: &str, response: &str) -> BenchResult<f64> {
        response.trim().parse::<f64>().map_err(|_| {
            self.state_known.store(false, Ordering::SeqCst);
            warn!(resource = %self.resource(), command, response, "Unparseable response");
            BenchError::protocol(
                self.resource(),
                format!("'{command}' returned '{response}', expected a number"),
            )
        })
    }

    fn supply_channel(&self, channel: &str) -> BenchResult<&'static ChannelSpec> {
        let (descriptor, _) = self
            .supply()
            .ok_or_else(|| self.capability_missing("psu"))?;
        descriptor.supply_channel(channel).ok_or_else(|| {
            let names: Vec<_> = descriptor.supply_channels.iter().map(|c| c.name).collect();
            BenchError::Usage(format!(
                "unknown channel '{channel}' (expected one of {})",
                names.join(", ")
            ))
        })
    }

    fn scope_channel(&self, channel: u8) -> BenchResult<()> {
        let count = self.channel_count_scope();
        if channel == 0 || channel > count {
            return Err(BenchError::Usage(format!(
                "scope channel {channel} out of range 1..={count}"
            )));
        }
        Ok(())
    }

    fn channel_count_scope(&self) -> u8 {
        self.family.map_or(0, |(d, _)| d.scope_channels)
    }

    fn generator_channel(&self, spec: &GeneratorSpec, channel: u8) -> BenchResult<()> {
        if channel == 0 || channel > spec.channels {
            return Err(BenchError::Usage(format!(
                "generator channel {channel} out of range 1..={}",
                spec.channels
            )));
        }
        Ok(())
    }

    /// Write a supply command, selecting the channel first when the family needs it.
    async fn supply_write(&self, channel: &ChannelSpec, command: String) -> BenchResult<()> {
        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("psu"))?;
        let mut link = self.link.lock().await;
        if let Some(select) = templates.select {
            link.write(&render(select, &[("ch", channel.name.to_string())])?)
                .await?;
        }
        link.write(&command).await
    }
}

#[async_trait]
impl Instrument for ScpiInstrument {
    fn record(&self) -> &InstrumentRecord {
        &self.record
    }

    fn state_known(&self) -> bool {
        self.state_known.load(Ordering::SeqCst)
    }

    async fn identify(&self) -> BenchResult<String> {
        self.link.lock().await.query("*IDN?").await
    }

    async fn raw(&self, command: &str) -> BenchResult<Option<String>> {
        let command = command.trim();
        let mut link = self.link.lock().await;
        if command.ends_with('?') {
            link.query(command).await.map(Some)
        } else {
            link.write(command).await.map(|_| None)
        }
    }

    async fn reset(&self) -> BenchResult<()> {
        let mut link = self.link.lock().await;
        link.write("*RST").await?;
        link.write("*CLS").await?;
        self.state_known.store(true, Ordering::SeqCst);
        debug!(resource = %link.resource(), "Instrument reset");
        Ok(())
    }

    async fn close(&self) -> BenchResult<()> {
        self.link.lock().await.close().await
    }

    fn as_power_supply(&self) -> Option<&dyn PowerSupply> {
        (self.record.has(CapabilityTag::PowerSupply) && self.supply().is_some())
            .then_some(self as &dyn PowerSupply)
    }

    fn as_oscilloscope(&self) -> Option<&dyn Oscilloscope> {
        (self.record.has(CapabilityTag::Oscilloscope) && self.scope().is_some())
            .then_some(self as &dyn Oscilloscope)
    }

    fn as_multimeter(&self) -> Option<&dyn Multimeter> {
        (self.record.has(CapabilityTag::Multimeter) && self.meter().is_some())
            .then_some(self as &dyn Multimeter)
    }

    fn as_function_generator(&self) -> Option<&dyn FunctionGenerator> {
        (self.record.has(CapabilityTag::FunctionGenerator) && self.generator().is_some())
            .then_some(self as &dyn FunctionGenerator)
    }
}

// =============================================================================
// Power supply
// =============================================================================

#[async_trait]
impl PowerSupply for ScpiInstrument {
    fn channels(&self) -> Vec<String> {
        self.supply()
            .map(|(d, _)| d.supply_channels.iter().map(|c| c.name.to_string()).collect())
            .unwrap_or_default()
    }

    async fn set_voltage(&self, channel: &str, volts: f64) -> BenchResult<()> {
        let spec = self.supply_channel(channel)?;
        check_finite("voltage", volts)?;
        if volts < spec.min_volts || volts > spec.max_volts {
            return Err(BenchError::Safety(format!(
                "{volts} V is outside {}..={} V on {}",
                spec.min_volts, spec.max_volts, spec.name
            )));
        }
        check_cap("voltage", volts, self.safety.max_voltage)?;

        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("volt"))?;
        let command = render(templates.voltage, &[("volts", format!("{volts:.3}"))])?;
        self.supply_write(spec, command).await
    }

    async fn set_current_limit(&self, channel: &str, amps: f64) -> BenchResult<()> {
        let spec = self.supply_channel(channel)?;
        check_finite("current", amps)?;
        if amps < 0.0 || amps > spec.max_amps {
            return Err(BenchError::Safety(format!(
                "{amps} A is outside 0..={} A on {}",
                spec.max_amps, spec.name
            )));
        }
        check_cap("current", amps, self.safety.max_current)?;

        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("curr"))?;
        let command = render(templates.current, &[("amps", format!("{amps:.3}"))])?;
        self.supply_write(spec, command).await
    }

    async fn output_on(&self) -> BenchResult<()> {
        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("output"))?;
        let command = render(templates.output, &[("state", on_off(true))])?;
        self.link.lock().await.write(&command).await
    }

    async fn output_off(&self) -> BenchResult<()> {
        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("output"))?;
        let command = render(templates.output, &[("state", on_off(false))])?;
        self.link.lock().await.write(&command).await
    }

    async fn measure_actual(&self, channel: &str) -> BenchResult<PowerReading> {
        let spec = self.supply_channel(channel)?;
        let (_, templates) = self
            .supply()
            .ok_or_else(|| self.capability_missing("meas"))?;

        let (volts, amps) = {
            let mut link = self.link.lock().await;
            if let Some(select) = templates.select {
                link.write(&render(select, &[("ch", spec.name.to_string())])?)
                    .await?;
            }
            let volts = link.query(templates.measure_voltage).await?;
            let amps = link.query(templates.measure_current).await?;
            (volts, amps)
        };

        Ok(PowerReading {
            volts: self.parse_number(templates.measure_voltage, &volts)?,
            amps: self.parse_number(templates.measure_current, &amps)?,
        })
    }
}

// =============================================================================
// Function generator
// =============================================================================

#[async_trait]
impl FunctionGenerator for ScpiInstrument {
    fn channel_count(&self) -> u8 {
        self.generator().map_or(0, |(spec, _)| spec.channels)
    }

    async fn set_waveform(
        &self,
        channel: u8,
        shape: WaveShape,
        frequency: f64,
        amplitude: f64,
        offset: f64,
    ) -> BenchResult<()> {
        let (spec, templates) = self
            .generator()
            .ok_or_else(|| self.capability_missing("wave"))?;
        self.generator_channel(&spec, channel)?;
        check_generator_bounds(&spec, &self.safety, frequency, amplitude, offset)?;
        let mnemonic = templates
            .shapes
            .iter()
            .find(|(s, _)| *s == shape)
            .map(|(_, m)| *m)
            .ok_or_else(|| {
                BenchError::Usage(format!("{} cannot generate {shape:?}", self.record.display_name()))
            })?;

        let vars = [
            ("ch", channel.to_string()),
            ("shape", mnemonic.to_string()),
            ("freq", frequency.to_string()),
            ("amp", amplitude.to_string()),
            ("offset", offset.to_string()),
        ];
        let commands = templates
            .waveform
            .iter()
            .map(|t| render(t, &vars))
            .collect::<BenchResult<Vec<_>>>()?;

        let mut link = self.link.lock().await;
        for command in &commands {
            link.write(command).await?;
        }
        Ok(())
    }

    async fn set_output(&self, channel: u8, enabled: bool) -> BenchResult<()> {
        let (spec, templates) = self
            .generator()
            .ok_or_else(|| self.capability_missing("output"))?;
        self.generator_channel(&spec, channel)?;
        let command = render(
            templates.output,
            &[("ch", channel.to_string()), ("state", on_off(enabled))],
        )?;
        self.link.lock().await.write(&command).await
    }

    /// Every channel is attempted; the first failure is returned.
    async fn outputs_off(&self) -> BenchResult<()> {
        let mut first_error = None;
        for channel in 1..=FunctionGenerator::channel_count(self) {
            if let Err(e) = self.set_output(channel, false).await {
                warn!(resource = %self.record.resource_id, channel, error = %e, "Output off failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Frequency, amplitude and offset against declared limits and bench caps.
pub(crate) fn check_generator_bounds(
    spec: &GeneratorSpec,
    safety: &SafetyConfig,
    frequency: f64,
    amplitude: f64,
    offset: f64,
) -> BenchResult<()> {
    check_finite("frequency", frequency)?;
    check_finite("amplitude", amplitude)?;
    check_finite("offset", offset)?;
    if frequency <= 0.0 || frequency > spec.max_frequency {
        return Err(BenchError::Safety(format!(
            "{frequency} Hz is outside 0..={} Hz",
            spec.max_frequency
        )));
    }
    if amplitude < 0.0 || amplitude > spec.max_amplitude {
        return Err(BenchError::Safety(format!(
            "{amplitude} Vpp is outside 0..={} Vpp",
            spec.max_amplitude
        )));
    }
    check_cap("frequency", frequency, safety.max_frequency)?;
    check_cap("amplitude", amplitude, safety.max_amplitude)
}

// =============================================================================
// Oscilloscope
// =============================================================================

#[async_trait]
impl Oscilloscope for ScpiInstrument {
    fn channel_count(&self) -> u8 {
        self.channel_count_scope()
    }

    async fn autoset(&self) -> BenchResult<()> {
        let (_, templates) = self
            .scope()
            .ok_or_else(|| self.capability_missing("autoset"))?;
        self.link.lock().await.write(templates.autoset).await
    }

    async fn acquire(&self, channel: u8) -> BenchResult<WaveformRecord> {
        let (_, templates) = self
            .scope()
            .ok_or_else(|| self.capability_missing("acquire"))?;
        self.scope_channel(channel)?;
        let vars = [("ch", channel.to_string())];
        let setup = templates
            .waveform_setup
            .iter()
            .map(|t| render(t, &vars))
            .collect::<BenchResult<Vec<_>>>()?;

        let (data, x_increment, scaling) = {
            let mut link = self.link.lock().await;
            for command in &setup {
                link.write(command).await?;
            }
            let data = link.query(templates.waveform_data).await?;
            let x_increment = match templates.x_increment {
                Some(query) => Some((query, link.query(query).await?)),
                None => None,
            };
            let scaling = match templates.y_scaling {
                Some(queries) => {
                    let mut values = Vec::with_capacity(3);
                    for query in queries {
                        values.push((query, link.query(query).await?));
                    }
                    Some(values)
                }
                None => None,
            };
            (data, x_increment, scaling)
        };

        let mut samples = strip_block_header(&data)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.parse_number(templates.waveform_data, s))
            .collect::<BenchResult<Vec<f64>>>()?;

        if let Some(values) = scaling {
            let mut parsed = [0.0; 3];
            for (slot, (query, response)) in parsed.iter_mut().zip(&values) {
                *slot = self.parse_number(query, response)?;
            }
            let [ymult, yoff, yzero] = parsed;
            for sample in &mut samples {
                *sample = (*sample - yoff) * ymult + yzero;
            }
        }

        let x_increment = match x_increment {
            Some((query, response)) => Some(self.parse_number(query, &response)?),
            None => None,
        };

        debug!(resource = %self.resource(), channel, samples = samples.len(), "Waveform acquired");
        Ok(WaveformRecord {
            channel,
            x_increment,
            samples,
        })
    }

    async fn configure(&self, settings: &ScopeSettings) -> BenchResult<()> {
        let (_, templates) = self
            .scope()
            .ok_or_else(|| self.capability_missing("configure"))?;
        let channel = settings.channel.unwrap_or(1);
        self.scope_channel(channel)?;
        for (what, value) in [
            ("vertical scale", settings.vertical_scale),
            ("horizontal scale", settings.horizontal_scale),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(BenchError::Usage(format!("{what} must be positive, got {v}")));
                }
            }
        }

        let ch = ("ch", channel.to_string());
        let mut commands = Vec::new();
        if let Some(display) = settings.display {
            commands.push(render(templates.display, &[ch.clone(), ("state", on_off(display))])?);
        }
        if let Some(scale) = settings.vertical_scale {
            commands.push(render(templates.vertical_scale, &[ch.clone(), ("value", scale.to_string())])?);
        }
        if let Some(scale) = settings.horizontal_scale {
            commands.push(render(templates.horizontal_scale, &[("value", scale.to_string())])?);
        }
        if let Some(coupling) = settings.coupling {
            commands.push(render(
                templates.coupling,
                &[ch.clone(), ("value", coupling.scpi().to_string())],
            )?);
        }
        if let Some(level) = settings.trigger_level {
            check_finite("trigger level", level)?;
            commands.push(render(templates.trigger_level, &[("value", level.to_string())])?);
        }

        let mut link = self.link.lock().await;
        for command in &commands {
            link.write(command).await?;
        }
        Ok(())
    }

    async fn run(&self) -> BenchResult<()> {
        let (_, templates) = self
            .scope()
            .ok_or_else(|| self.capability_missing("run"))?;
        self.link.lock().await.write(templates.run).await
    }

    async fn stop(&self) -> BenchResult<()> {
        let (_, templates) = self
            .scope()
            .ok_or_else(|| self.capability_missing("stop"))?;
        self.link.lock().await.write(templates.stop).await
    }
}

// =============================================================================
// Multimeter
// =============================================================================

#[async_trait]
impl Multimeter for ScpiInstrument {
    async fn measure(
        &self,
        function: MeasureFunction,
        range: Option<f64>,
        resolution: Option<f64>,
    ) -> BenchResult<Reading> {
        let templates = self.meter().ok_or_else(|| self.capability_missing("meas"))?;
        let or_default = |value: Option<f64>| value.map_or_else(|| "DEF".to_string(), |v| v.to_string());
        let vars = [
            ("function", function.scpi().to_string()),
            ("range", or_default(range)),
            ("resolution", or_default(resolution)),
        ];
        let configure = templates
            .configure
            .map(|t| render(t, &vars))
            .transpose()?;
        let template = if function.takes_range() {
            templates.measure
        } else {
            templates.measure_fixed
        };
        let query = render(template, &vars)?;

        let response = {
            let mut link = self.link.lock().await;
            if let Some(command) = &configure {
                link.write(command).await?;
            }
            link.query(&query).await?
        };

        Ok(Reading {
            function,
            value: self.parse_number(&query, &response)?,
            unit: function.unit().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, SafetyConfig};
    use crate::hardware::{open_driver, DriverContext, DriverHandle};
    use crate::transport::sim::{SimDevice, SimulatedBench};
    use crate::transport::{ResourceLocks, TransportKind};

    const PSU: &str = "GPIB0::5::INSTR";

    async fn open(bench: &SimulatedBench, kind: TransportKind, address: &str, idn: &str) -> DriverHandle {
        let config = BenchConfig::ephemeral();
        let locks = ResourceLocks::new();
        let record = InstrumentRecord::identified(kind, address, idn, None);
        open_driver(
            &record,
            "test",
            DriverContext {
                backend: bench,
                locks: &locks,
                transport: &config.transport,
                safety: &SafetyConfig::default(),
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn renders_templates_and_block_headers() {
        assert_eq!(
            render("INST:SEL {ch}", &[("ch", "P6V".to_string())]).unwrap(),
            "INST:SEL P6V"
        );
        assert!(render("VOLT {volts}", &[]).is_err());
        assert_eq!(strip_block_header("#41234,5,6"), ",5,6");
        assert_eq!(strip_block_header("1,2,3"), "1,2,3");
    }

    #[tokio::test]
    async fn supply_selects_channel_before_programming() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench, TransportKind::Gpib, PSU, "HEWLETT-PACKARD,E3631A,0,2.1").await;
        let psu = driver.as_power_supply().unwrap();
        psu.set_voltage("p6v", 5.0).await.unwrap();
        psu.set_current_limit("1", 0.2).await.unwrap();
        assert_eq!(
            bench.commands(TransportKind::Gpib, PSU),
            vec!["INST:SEL P6V", "VOLT 5.000", "INST:SEL P6V", "CURR 0.200"]
        );
    }

    #[tokio::test]
    async fn out_of_range_voltage_sends_nothing() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench, TransportKind::Gpib, PSU, "HEWLETT-PACKARD,E3631A,0,2.1").await;
        let psu = driver.as_power_supply().unwrap();
        assert!(matches!(psu.set_voltage("P6V", 7.5).await, Err(BenchError::Safety(_))));
        assert!(matches!(psu.set_voltage("N25V", 5.0).await, Err(BenchError::Safety(_))));
        assert!(matches!(psu.set_voltage("P9V", 1.0).await, Err(BenchError::Usage(_))));
        assert_eq!(bench.bytes_written(TransportKind::Gpib, PSU), 0);
    }

    #[tokio::test]
    async fn measure_parses_scientific_notation() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench, TransportKind::Gpib, PSU, "HEWLETT-PACKARD,E3631A,0,2.1").await;
        let reading = driver.as_power_supply().unwrap().measure_actual("P6V").await.unwrap();
        assert!((reading.volts - 5.0012).abs() < 1e-9);
        assert!((reading.amps - 0.102).abs() < 1e-9);
    }

    #[tokio::test]
    async fn garbage_response_marks_state_unknown_until_reset() {
        let bench = SimulatedBench::new();
        bench.add(
            TransportKind::Gpib,
            PSU,
            SimDevice::new("HEWLETT-PACKARD,E3631A,0,2.1").with_response("MEAS:VOLT?", "OVLD"),
        );
        let driver = open(&bench, TransportKind::Gpib, PSU, "HEWLETT-PACKARD,E3631A,0,2.1").await;
        let err = driver.as_power_supply().unwrap().measure_actual("P6V").await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol { .. }));
        assert!(!driver.state_known());
        driver.reset().await.unwrap();
        assert!(driver.state_known());
    }

    #[tokio::test]
    async fn scope_scales_curve_data() {
        let bench = SimulatedBench::demo();
        let address = "USB0::0x0699::0x03A4::C012345::INSTR";
        let driver = open(
            &bench,
            TransportKind::UsbTmc,
            address,
            "TEKTRONIX,MSO2024,C012345,CF:91.1CT FV:v1.52",
        )
        .await;
        let scope = driver.as_oscilloscope().unwrap();
        let record = scope.acquire(1).await.unwrap();
        assert_eq!(record.samples.len(), 8);
        assert_eq!(record.x_increment, Some(4.0e-7));
        let (lo, hi) = record.extent().unwrap();
        assert!((hi - 0.2).abs() < 1e-9);
        assert!((lo + 0.2).abs() < 1e-9);
        assert!(matches!(scope.acquire(5).await, Err(BenchError::Usage(_))));
        assert!(driver.as_power_supply().is_none());
    }

    #[tokio::test]
    async fn generator_rejects_excess_amplitude() {
        let bench = SimulatedBench::demo();
        let address = "USB0::0xF4EC::0xEE38::574B21101::INSTR";
        let driver = open(
            &bench,
            TransportKind::UsbTmc,
            address,
            "B&K Precision,4063,574B21101,5.01.01.12R5",
        )
        .await;
        let awg = driver.as_function_generator().unwrap();
        assert!(matches!(
            awg.set_waveform(1, WaveShape::Sine, 1000.0, 25.0, 0.0).await,
            Err(BenchError::Safety(_))
        ));
        awg.set_waveform(2, WaveShape::Square, 1000.0, 2.0, 0.5).await.unwrap();
        awg.outputs_off().await.unwrap();
        assert_eq!(
            bench.commands(TransportKind::UsbTmc, address),
            vec![
                "C2:BSWV WVTP,SQUARE,FRQ,1000,AMP,2,OFST,0.5",
                "C1:OUTP OFF",
                "C2:OUTP OFF",
            ]
        );
    }

    #[tokio::test]
    async fn outputs_off_continues_past_a_failing_channel() {
        let bench = SimulatedBench::demo();
        let address = "USB0::0xF4EC::0xEE38::574B21101::INSTR";
        let driver = open(
            &bench,
            TransportKind::UsbTmc,
            address,
            "B&K Precision,4063,574B21101,5.01.01.12R5",
        )
        .await;
        bench.fail_commands(TransportKind::UsbTmc, address, "C1:OUTP");

        let result = driver.as_function_generator().unwrap().outputs_off().await;

        assert!(result.is_err());
        assert_eq!(
            bench.commands(TransportKind::UsbTmc, address),
            vec!["C1:OUTP OFF", "C2:OUTP OFF"]
        );
    }

    #[tokio::test]
    async fn unknown_instrument_only_has_uniform_operations() {
        let bench = SimulatedBench::new();
        bench.add(TransportKind::UsbTmc, "USB0::1::INSTR", SimDevice::new("ACME,WIDGET,1,1"));
        let driver = open(&bench, TransportKind::UsbTmc, "USB0::1::INSTR", "ACME,WIDGET,1,1").await;
        assert!(driver.as_power_supply().is_none());
        assert!(driver.as_multimeter().is_none());
        assert_eq!(driver.raw("SYST:ERR?").await.unwrap(), Some("0".to_string()));
        assert_eq!(driver.raw("*CLS").await.unwrap(), None);
        assert_eq!(driver.identify().await.unwrap(), "ACME,WIDGET,1,1");
    }

    #[tokio::test]
    async fn meter_uses_default_range_and_resolution() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench, TransportKind::Gpib, "GPIB0::22::INSTR", "HEWLETT-PACKARD,34401A,0,11-5-2").await;
        let dmm = driver.as_multimeter().unwrap();
        let reading = dmm.measure(MeasureFunction::DcVolts, None, None).await.unwrap();
        assert_eq!(reading.unit, "V");
        assert!((reading.value - 1.23456).abs() < 1e-9);
        dmm.measure(MeasureFunction::Diode, Some(10.0), None).await.unwrap();
        assert_eq!(
            bench.commands(TransportKind::Gpib, "GPIB0::22::INSTR"),
            vec!["MEAS:VOLT:DC? DEF,DEF", "MEAS:DIOD?"]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_traffic() {
        let bench = SimulatedBench::demo();
        let driver = open(&bench, TransportKind::Gpib, PSU, "HEWLETT-PACKARD,E3631A,0,2.1").await;
        driver.close().await.unwrap();
        driver.close().await.unwrap();
        assert!(matches!(driver.identify().await, Err(BenchError::Transport { .. })));
    }
}
