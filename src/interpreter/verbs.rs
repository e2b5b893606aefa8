//! Instrument verb tables and their dispatch onto capability traits.
//!
//! Lookup walks the declared capabilities in the order PowerSupply,
//! FunctionGenerator, Oscilloscope, Multimeter and takes the first table that
//! knows the verb. `idn`, `raw` and `reset` work on every instrument.
//!
//! Supply `meas` and meter `meas`/`read` also hand back their values as
//! [`Measurement`]s for the session's log, labelled by `label=` when given.

use super::parser::{parse_bool, parse_channel, parse_number, Args};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{
    CapabilityTag, Coupling, FunctionGenerator, MeasureFunction, Multimeter, Oscilloscope,
    PowerSupply, ScopeSettings, WaveShape,
};
use crate::hardware::Instrument;
use crate::measurement::Measurement;
use tracing::debug;

/// Text for the operator plus any values to log.
#[derive(Debug, Default)]
pub struct VerbOutput {
    /// Reply text
    pub text: String,
    /// Values taken by the verb
    pub measurements: Vec<Measurement>,
}

impl From<String> for VerbOutput {
    fn from(text: String) -> Self {
        Self {
            text,
            measurements: Vec::new(),
        }
    }
}

/// Verbs accepted for every alias.
pub const UNIFORM_VERBS: &[&str] = &["idn", "raw", "reset"];

/// Order capabilities are searched in.
pub const LOOKUP_ORDER: [CapabilityTag; 4] = [
    CapabilityTag::PowerSupply,
    CapabilityTag::FunctionGenerator,
    CapabilityTag::Oscilloscope,
    CapabilityTag::Multimeter,
];

/// `(verb, usage)` per capability.
pub fn verb_table(tag: CapabilityTag) -> &'static [(&'static str, &'static str)] {
    match tag {
        CapabilityTag::PowerSupply => &[
            ("set", "set [ch] <volts> [amps]"),
            ("volt", "volt [ch] <volts>"),
            ("curr", "curr [ch] <amps>"),
            ("output", "output on|off"),
            ("meas", "meas [ch] [label=]"),
        ],
        CapabilityTag::FunctionGenerator => &[
            ("wave", "wave <ch> <shape> [freq=] [amp=] [offset=]"),
            ("output", "output <ch|both> on|off"),
        ],
        CapabilityTag::Oscilloscope => &[
            ("autoset", "autoset"),
            ("run", "run"),
            ("stop", "stop"),
            ("acquire", "acquire <ch>"),
            (
                "configure",
                "configure [ch=] [vscale=] [hscale=] [coupling=] [trigger=] [display=on|off]",
            ),
        ],
        CapabilityTag::Multimeter => &[
            ("meas", "meas <function> [range] [resolution] [label=]"),
            ("read", "read [label=]"),
        ],
    }
}

fn knows(tag: CapabilityTag, verb: &str) -> bool {
    verb_table(tag).iter().any(|(v, _)| *v == verb)
}

/// Run `verb` on the instrument bound to `alias`.
///
/// `selector` restricts lookup to one capability (`scope awg wave ...`).
pub async fn dispatch(
    alias: &str,
    driver: &dyn Instrument,
    selector: Option<CapabilityTag>,
    verb: &str,
    tokens: &[String],
) -> BenchResult<VerbOutput> {
    let verb_lower = verb.to_ascii_lowercase();
    let rejected = || BenchError::Capability {
        alias: alias.to_string(),
        verb: match selector {
            Some(tag) => format!("{} {verb}", tag.keyword()),
            None => verb.to_string(),
        },
    };

    if selector.is_none() && UNIFORM_VERBS.contains(&verb_lower.as_str()) {
        return uniform(driver, &verb_lower, tokens).await.map(VerbOutput::from);
    }

    let candidates: Vec<CapabilityTag> = match selector {
        Some(tag) => vec![tag],
        None => LOOKUP_ORDER.to_vec(),
    };
    let tag = candidates
        .into_iter()
        .filter(|tag| driver.record().has(*tag))
        .find(|tag| knows(*tag, &verb_lower))
        .ok_or_else(rejected)?;
    debug!(alias, verb = %verb_lower, capability = %tag, "Dispatching");

    let args = Args::parse(tokens);
    match tag {
        CapabilityTag::PowerSupply => {
            let psu = driver.as_power_supply().ok_or_else(rejected)?;
            power_supply(alias, driver, psu, &verb_lower, &args).await
        }
        CapabilityTag::FunctionGenerator => {
            let awg = driver.as_function_generator().ok_or_else(rejected)?;
            generator(awg, &verb_lower, &args).await.map(VerbOutput::from)
        }
        CapabilityTag::Oscilloscope => {
            let scope = driver.as_oscilloscope().ok_or_else(rejected)?;
            oscilloscope(scope, &verb_lower, &args).await.map(VerbOutput::from)
        }
        CapabilityTag::Multimeter => {
            let dmm = driver.as_multimeter().ok_or_else(rejected)?;
            multimeter(alias, dmm, &verb_lower, &args).await
        }
    }
}

async fn uniform(driver: &dyn Instrument, verb: &str, tokens: &[String]) -> BenchResult<String> {
    match verb {
        "idn" => driver.identify().await,
        "raw" => {
            if tokens.is_empty() {
                return Err(BenchError::Usage("usage: raw <text>".to_string()));
            }
            Ok(driver.raw(&tokens.join(" ")).await?.unwrap_or_default())
        }
        _ => {
            driver.reset().await?;
            Ok(format!("{} reset", driver.record().display_name()))
        }
    }
}

// =============================================================================
// Power supply
// =============================================================================

/// Split off the channel argument.
///
/// The first positional counts as a channel when it names one the model
/// declares. A single-channel supply lets it be omitted, and there a token
/// that parses as a number is always a value, so `set 1 0.5` means 1 V.
fn supply_channel<'a>(
    driver: &dyn Instrument,
    psu: &dyn PowerSupply,
    args: &'a Args,
) -> BenchResult<(String, &'a [String])> {
    let channels = psu.channels();
    let canonical = |text: &str| match driver.record().descriptor() {
        Some(descriptor) => descriptor.supply_channel(text).map(|c| c.name.to_string()),
        None => channels.iter().find(|c| c.eq_ignore_ascii_case(text)).cloned(),
    };
    let single = channels.len() == 1;
    if let Some((first, rest)) = args.positional.split_first() {
        let numeric = parse_number(first).is_ok();
        if !(single && numeric) {
            if let Some(name) = canonical(first) {
                return Ok((name, rest));
            }
        }
    }
    match (channels.as_slice(), args.positional.split_first()) {
        ([only], _) => Ok((only.clone(), &args.positional[..])),
        (_, Some((first, rest))) => Ok((first.clone(), rest)),
        (_, None) => Err(BenchError::Usage(format!(
            "channel required (one of {})",
            channels.join(", ")
        ))),
    }
}

fn value<'a>(rest: &'a [String], index: usize, what: &str) -> BenchResult<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .ok_or_else(|| BenchError::Usage(format!("missing {what}")))
}

async fn power_supply(
    alias: &str,
    driver: &dyn Instrument,
    psu: &dyn PowerSupply,
    verb: &str,
    args: &Args,
) -> BenchResult<VerbOutput> {
    let text = match verb {
        "set" => {
            let (channel, rest) = supply_channel(driver, psu, args)?;
            let volts = parse_number(value(rest, 0, "voltage")?)?;
            let amps = rest.get(1).map(|a| parse_number(a)).transpose()?;
            psu.set_voltage(&channel, volts).await?;
            match amps {
                Some(amps) => {
                    psu.set_current_limit(&channel, amps).await?;
                    format!("{channel}: {volts:.3} V, limit {amps:.3} A")
                }
                None => format!("{channel}: {volts:.3} V"),
            }
        }
        "volt" => {
            let (channel, rest) = supply_channel(driver, psu, args)?;
            let volts = parse_number(value(rest, 0, "voltage")?)?;
            psu.set_voltage(&channel, volts).await?;
            format!("{channel}: {volts:.3} V")
        }
        "curr" => {
            let (channel, rest) = supply_channel(driver, psu, args)?;
            let amps = parse_number(value(rest, 0, "current")?)?;
            psu.set_current_limit(&channel, amps).await?;
            format!("{channel}: limit {amps:.3} A")
        }
        "output" => {
            if parse_bool(args.required(0, "on|off")?)? {
                psu.output_on().await?;
                "output on".to_string()
            } else {
                psu.output_off().await?;
                "output off".to_string()
            }
        }
        _ => {
            args.only(&["label"])?;
            let (channel, _) = supply_channel(driver, psu, args)?;
            let reading = psu.measure_actual(&channel).await?;
            let label = args
                .named
                .get("label")
                .cloned()
                .unwrap_or_else(|| format!("{alias}_{}", channel.to_ascii_lowercase()));
            let source = format!("{alias}.meas");
            return Ok(VerbOutput {
                text: format!("{channel}: {:.4} V  {:.4} A", reading.volts, reading.amps),
                measurements: vec![
                    Measurement::new(format!("{label}_v"), reading.volts, "V", source.clone()),
                    Measurement::new(format!("{label}_i"), reading.amps, "A", source),
                ],
            });
        }
    };
    Ok(text.into())
}

// =============================================================================
// Function generator
// =============================================================================

const DEFAULT_FREQUENCY: f64 = 1_000.0;
const DEFAULT_AMPLITUDE: f64 = 1.0;

async fn generator(awg: &dyn FunctionGenerator, verb: &str, args: &Args) -> BenchResult<String> {
    match verb {
        "wave" => {
            args.only(&["freq", "amp", "offset"])?;
            let channel = parse_channel(args.required(0, "channel")?)?;
            let shape: WaveShape = args.required(1, "waveform shape")?.parse()?;
            let positional = |i: usize| args.positional.get(i).map(|v| parse_number(v)).transpose();
            let frequency = args
                .number("freq")?
                .or(positional(2)?)
                .unwrap_or(DEFAULT_FREQUENCY);
            let amplitude = args
                .number("amp")?
                .or(positional(3)?)
                .unwrap_or(DEFAULT_AMPLITUDE);
            let offset = args.number("offset")?.or(positional(4)?).unwrap_or(0.0);
            awg.set_waveform(channel, shape, frequency, amplitude, offset)
                .await?;
            Ok(format!(
                "CH{channel}: {shape:?} {frequency} Hz, {amplitude} Vpp, offset {offset} V"
            ))
        }
        _ => {
            let target = args.required(0, "channel or 'both'")?;
            let enabled = parse_bool(args.required(1, "on|off")?)?;
            let channels: Vec<u8> = match target.to_ascii_lowercase().as_str() {
                "both" | "all" => (1..=awg.channel_count()).collect(),
                _ => vec![parse_channel(target)?],
            };
            for &channel in &channels {
                awg.set_output(channel, enabled).await?;
            }
            let state = if enabled { "on" } else { "off" };
            let names: Vec<String> = channels.iter().map(|c| format!("CH{c}")).collect();
            Ok(format!("{} output {state}", names.join(", ")))
        }
    }
}

// =============================================================================
// Oscilloscope
// =============================================================================

async fn oscilloscope(scope: &dyn Oscilloscope, verb: &str, args: &Args) -> BenchResult<String> {
    match verb {
        "autoset" => scope.autoset().await.map(|_| "autoset".to_string()),
        "run" => scope.run().await.map(|_| "running".to_string()),
        "stop" => scope.stop().await.map(|_| "stopped".to_string()),
        "acquire" => {
            let channel = parse_channel(args.required(0, "channel")?)?;
            let waveform = scope.acquire(channel).await?;
            let mut summary = format!("CH{channel}: {} samples", waveform.samples.len());
            if let Some((lo, hi)) = waveform.extent() {
                summary.push_str(&format!(", min {lo:.4} V, max {hi:.4} V"));
            }
            if let Some(dt) = waveform.x_increment {
                summary.push_str(&format!(", dt {dt:e} s"));
            }
            Ok(summary)
        }
        _ => {
            args.only(&["ch", "vscale", "hscale", "coupling", "trigger", "display"])?;
            let settings = ScopeSettings {
                channel: args.named.get("ch").map(|c| parse_channel(c)).transpose()?,
                display: args.named.get("display").map(|d| parse_bool(d)).transpose()?,
                vertical_scale: args.number("vscale")?,
                horizontal_scale: args.number("hscale")?,
                coupling: args
                    .named
                    .get("coupling")
                    .map(|c| c.parse::<Coupling>())
                    .transpose()?,
                trigger_level: args.number("trigger")?,
            };
            if settings.is_empty() {
                return Err(BenchError::Usage(
                    "configure needs at least one of vscale=, hscale=, coupling=, trigger=, display="
                        .to_string(),
                ));
            }
            scope.configure(&settings).await?;
            Ok("configured".to_string())
        }
    }
}

// =============================================================================
// Multimeter
// =============================================================================

fn optional_number(text: Option<&String>) -> BenchResult<Option<f64>> {
    match text.map(String::as_str) {
        None => Ok(None),
        Some(t) if ["auto", "def", "default"].contains(&t.to_ascii_lowercase().as_str()) => Ok(None),
        Some(t) => parse_number(t).map(Some),
    }
}

async fn multimeter(
    alias: &str,
    dmm: &dyn Multimeter,
    verb: &str,
    args: &Args,
) -> BenchResult<VerbOutput> {
    args.only(&["label"])?;
    let (function, range, resolution) = match verb {
        "read" => (MeasureFunction::DcVolts, None, None),
        _ => (
            args.required(0, "measurement function")?.parse()?,
            optional_number(args.positional.get(1))?,
            optional_number(args.positional.get(2))?,
        ),
    };
    let reading = dmm.measure(function, range, resolution).await?;
    let label = args.named.get("label").cloned().unwrap_or_else(|| {
        format!("{alias}_{}", function.scpi().replace(':', "_").to_ascii_lowercase())
    });
    Ok(VerbOutput {
        text: reading.to_string(),
        measurements: vec![Measurement::new(
            label,
            reading.value,
            reading.unit.clone(),
            format!("{alias}.{verb}"),
        )],
    })
}
