//! Instrument Registry
//!
//! Maps identification strings to known model families. Each family carries a
//! [`ModelDescriptor`]: vendor and model names, declared capabilities, the aliases
//! the session binds it to, per-channel limits, and the command dialect its
//! driver speaks.
//!
//! # Known Instruments
//!
//! | Model | Capabilities | Alias | Fallback |
//! |-------|--------------|-------|----------|
//! | Tektronix MSO2024 | Oscilloscope | `scope` | `scope_tek` |
//! | Rigol DHO804 | Oscilloscope | `scope` | `scope_rigol` |
//! | Rigol DHO914S | Oscilloscope, FunctionGenerator | `scope` | `scope_dho914s` |
//! | HP E3631A | PowerSupply | `psu` | `psu_hp` |
//! | MATRIX MPS-6010H-1C | PowerSupply | `psu` | `psu_matrix` |
//! | HP 34401A | Multimeter | `dmm` | `dmm_hp` |
//! | OWON XDM1041 | Multimeter | `dmm` | `dmm_owon` |
//! | B&K Precision 4063 | FunctionGenerator | `awg` | `awg_bk` |
//! | Keysight EDU33212A | FunctionGenerator | `awg` | `awg_keysight` |
//! | Joy-IT JDS6600 | FunctionGenerator | `awg` | `awg_jds` |
//!
//! Matching is a case- and whitespace-insensitive substring test, applied to the
//! model field of the identification when it has one and to the whole string
//! otherwise. Unknown identifications resolve to `None`; discovery still
//! produces a record for them, with an empty capability set.

use crate::hardware::capabilities::{CapabilityTag, WaveShape};

/// Static description of a model family.
#[derive(Debug)]
pub struct ModelDescriptor {
    /// Vendor as displayed
    pub vendor: &'static str,
    /// Model as displayed
    pub model: &'static str,
    /// Substrings identifying the family
    pub patterns: &'static [&'static str],
    /// Declared capabilities
    pub capabilities: &'static [CapabilityTag],
    /// Preferred alias for auto-binding
    pub alias: &'static str,
    /// Alias used when the preferred one is taken
    pub fallback_alias: &'static str,
    /// Supply outputs, empty when not a supply
    pub supply_channels: &'static [ChannelSpec],
    /// Generator limits, when a generator
    pub generator: Option<GeneratorSpec>,
    /// Analog scope channels, zero when not a scope
    pub scope_channels: u8,
    /// Preferred serial baud rate
    pub serial_baud: Option<u32>,
    /// Outgoing line termination
    pub write_termination: &'static str,
    /// Command set spoken by the driver
    pub dialect: Dialect,
}

impl ModelDescriptor {
    /// Whether the family declares a capability.
    pub fn has(&self, tag: CapabilityTag) -> bool {
        self.capabilities.contains(&tag)
    }

    /// Find a supply channel by name or alias, case-insensitively.
    pub fn supply_channel(&self, name: &str) -> Option<&'static ChannelSpec> {
        self.supply_channels.iter().find(|spec| spec.matches(name))
    }
}

/// Limits and naming of one supply output.
#[derive(Debug)]
pub struct ChannelSpec {
    /// Canonical channel name
    pub name: &'static str,
    /// Other accepted names
    pub aliases: &'static [&'static str],
    /// Lowest settable voltage
    pub min_volts: f64,
    /// Highest settable voltage
    pub max_volts: f64,
    /// Highest settable current limit
    pub max_amps: f64,
}

impl ChannelSpec {
    /// Whether `name` designates this channel.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Generator limits.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorSpec {
    /// Number of outputs
    pub channels: u8,
    /// Highest frequency in Hz
    pub max_frequency: f64,
    /// Highest amplitude in Vpp
    pub max_amplitude: f64,
}

/// How a driver talks to the family.
#[derive(Debug)]
pub enum Dialect {
    /// IEEE-488.2 / SCPI with per-family command templates
    Scpi(&'static ScpiCommands),
    /// JDS6600 register protocol over serial
    Jds6600,
}

/// Per-family SCPI command templates.
///
/// Templates use `{name}` placeholders filled in by the driver: `ch`, `volts`,
/// `amps`, `state`, `shape`, `freq`, `amp`, `offset`, `value`, `function`,
/// `range` and `resolution`.
#[derive(Debug)]
pub struct ScpiCommands {
    /// Sent once after the transport opens
    pub init: &'static [&'static str],
    /// Supply commands
    pub supply: Option<SupplyCommands>,
    /// Generator commands
    pub generator: Option<GeneratorCommands>,
    /// Scope commands
    pub scope: Option<ScopeCommands>,
    /// Meter commands
    pub meter: Option<MeterCommands>,
}

/// Supply command templates.
#[derive(Debug)]
#[allow(missing_docs)]
pub struct SupplyCommands {
    /// Selects the channel subsequent commands apply to
    pub select: Option<&'static str>,
    pub voltage: &'static str,
    pub current: &'static str,
    pub output: &'static str,
    pub measure_voltage: &'static str,
    pub measure_current: &'static str,
}

/// Generator command templates.
#[derive(Debug)]
pub struct GeneratorCommands {
    /// Commands programming a waveform, sent in order
    pub waveform: &'static [&'static str],
    /// Output switch
    pub output: &'static str,
    /// Shape mnemonics understood by the family
    pub shapes: &'static [(WaveShape, &'static str)],
}

/// Scope command templates.
#[derive(Debug)]
#[allow(missing_docs)]
pub struct ScopeCommands {
    pub autoset: &'static str,
    pub run: &'static str,
    pub stop: &'static str,
    pub display: &'static str,
    pub vertical_scale: &'static str,
    pub horizontal_scale: &'static str,
    pub coupling: &'static str,
    pub trigger_level: &'static str,
    /// Commands selecting the source and encoding before a transfer
    pub waveform_setup: &'static [&'static str],
    pub waveform_data: &'static str,
    pub x_increment: Option<&'static str>,
    /// Queries for the (multiplier, offset, zero) raw-to-volts scaling
    pub y_scaling: Option<[&'static str; 3]>,
}

/// Meter command templates.
#[derive(Debug)]
pub struct MeterCommands {
    /// Written before measuring, if the family configures separately
    pub configure: Option<&'static str>,
    /// Query returning a reading
    pub measure: &'static str,
    /// Query for functions that take no range or resolution
    pub measure_fixed: &'static str,
}

/// Identification exchange for devices that do not answer `*IDN?`.
#[derive(Debug)]
pub struct IdentityProbe {
    /// Query sent to the device
    pub query: &'static str,
    /// Expected response prefix (case-insensitive)
    pub expect_prefix: &'static str,
    /// Identification text recorded for a match; `{response}` is replaced
    pub identification: &'static str,
    /// Outgoing termination for the probe
    pub write_termination: &'static str,
}

// =============================================================================
// Command sets
// =============================================================================

const HP_SUPPLY: SupplyCommands = SupplyCommands {
    select: Some("INST:SEL {ch}"),
    voltage: "VOLT {volts}",
    current: "CURR {amps}",
    output: "OUTP:STAT {state}",
    measure_voltage: "MEAS:VOLT?",
    measure_current: "MEAS:CURR?",
};

static HP_E3631A: ScpiCommands = ScpiCommands {
    init: &[],
    supply: Some(HP_SUPPLY),
    generator: None,
    scope: None,
    meter: None,
};

static MATRIX_MPS6010H: ScpiCommands = ScpiCommands {
    init: &["REM:ON"],
    supply: Some(SupplyCommands {
        select: None,
        voltage: "VOLT {volts}",
        current: "CURR {amps}",
        output: "OUTP {state}",
        measure_voltage: "MEAS:VOLT?",
        measure_current: "MEAS:CURR?",
    }),
    generator: None,
    scope: None,
    meter: None,
};

static HP_34401A: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: None,
    scope: None,
    meter: Some(MeterCommands {
        configure: None,
        measure: "MEAS:{function}? {range},{resolution}",
        measure_fixed: "MEAS:{function}?",
    }),
};

static OWON_XDM1041: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: None,
    scope: None,
    meter: Some(MeterCommands {
        configure: Some("CONF:{function}"),
        measure: "MEAS?",
        measure_fixed: "MEAS?",
    }),
};

static BK_4063: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: Some(GeneratorCommands {
        waveform: &["C{ch}:BSWV WVTP,{shape},FRQ,{freq},AMP,{amp},OFST,{offset}"],
        output: "C{ch}:OUTP {state}",
        shapes: &[
            (WaveShape::Sine, "SINE"),
            (WaveShape::Square, "SQUARE"),
            (WaveShape::Ramp, "RAMP"),
            (WaveShape::Triangle, "RAMP"),
            (WaveShape::Pulse, "PULSE"),
            (WaveShape::Noise, "NOISE"),
            (WaveShape::Dc, "DC"),
        ],
    }),
    scope: None,
    meter: None,
};

static KEYSIGHT_EDU33212A: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: Some(GeneratorCommands {
        waveform: &[
            "SOUR{ch}:FUNC {shape}",
            "SOUR{ch}:FREQ {freq}",
            "SOUR{ch}:VOLT {amp}",
            "SOUR{ch}:VOLT:OFFS {offset}",
        ],
        output: "OUTP{ch} {state}",
        shapes: &[
            (WaveShape::Sine, "SIN"),
            (WaveShape::Square, "SQU"),
            (WaveShape::Ramp, "RAMP"),
            (WaveShape::Triangle, "TRI"),
            (WaveShape::Pulse, "PULS"),
            (WaveShape::Noise, "NOIS"),
            (WaveShape::Dc, "DC"),
        ],
    }),
    scope: None,
    meter: None,
};

const TEK_SCOPE: ScopeCommands = ScopeCommands {
    autoset: "AUTOSet EXECute",
    run: "ACQuire:STATE RUN",
    stop: "ACQuire:STATE STOP",
    display: "SELect:CH{ch} {state}",
    vertical_scale: "CH{ch}:SCAle {value}",
    horizontal_scale: "HORizontal:SCAle {value}",
    coupling: "CH{ch}:COUPling {value}",
    trigger_level: "TRIGger:A:LEVel {value}",
    waveform_setup: &["DATa:SOUrce CH{ch}", "DATa:ENCdg ASCIi"],
    waveform_data: "CURVe?",
    x_increment: Some("WFMOutpre:XINcr?"),
    y_scaling: Some(["WFMOutpre:YMUlt?", "WFMOutpre:YOFf?", "WFMOutpre:YZEro?"]),
};

const RIGOL_SCOPE: ScopeCommands = ScopeCommands {
    autoset: ":AUToscale",
    run: ":RUN",
    stop: ":STOP",
    display: ":CHANnel{ch}:DISPlay {state}",
    vertical_scale: ":CHANnel{ch}:SCALe {value}",
    horizontal_scale: ":TIMebase:SCALe {value}",
    coupling: ":CHANnel{ch}:COUPling {value}",
    trigger_level: ":TRIGger:EDGE:LEVel {value}",
    waveform_setup: &[":WAVeform:SOURce CHANnel{ch}", ":WAVeform:MODE NORMal", ":WAVeform:FORMat ASCii"],
    waveform_data: ":WAVeform:DATA?",
    x_increment: Some(":WAVeform:XINCrement?"),
    y_scaling: None,
};

static TEKTRONIX_MSO2024: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: None,
    scope: Some(TEK_SCOPE),
    meter: None,
};

static RIGOL_DHO804: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: None,
    scope: Some(RIGOL_SCOPE),
    meter: None,
};

static RIGOL_DHO914S: ScpiCommands = ScpiCommands {
    init: &[],
    supply: None,
    generator: Some(GeneratorCommands {
        waveform: &[
            ":SOURce:FUNCtion {shape}",
            ":SOURce:FREQuency {freq}",
            ":SOURce:VOLTage:AMPLitude {amp}",
            ":SOURce:VOLTage:OFFSet {offset}",
        ],
        output: ":SOURce:OUTPut:STATe {state}",
        shapes: &[
            (WaveShape::Sine, "SINusoid"),
            (WaveShape::Square, "SQUare"),
            (WaveShape::Ramp, "RAMP"),
            (WaveShape::Pulse, "PULSe"),
            (WaveShape::Noise, "NOISe"),
            (WaveShape::Dc, "DC"),
        ],
    }),
    scope: Some(RIGOL_SCOPE),
    meter: None,
};

// =============================================================================
// Model table
// =============================================================================

const SCOPE: &[CapabilityTag] = &[CapabilityTag::Oscilloscope];
const SCOPE_WITH_GENERATOR: &[CapabilityTag] =
    &[CapabilityTag::Oscilloscope, CapabilityTag::FunctionGenerator];
const SUPPLY: &[CapabilityTag] = &[CapabilityTag::PowerSupply];
const METER: &[CapabilityTag] = &[CapabilityTag::Multimeter];
const GENERATOR: &[CapabilityTag] = &[CapabilityTag::FunctionGenerator];

/// Every known model family, in match priority order.
pub static MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        vendor: "Tektronix",
        model: "MSO2024",
        patterns: &["MSO2024"],
        capabilities: SCOPE,
        alias: "scope",
        fallback_alias: "scope_tek",
        supply_channels: &[],
        generator: None,
        scope_channels: 4,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&TEKTRONIX_MSO2024),
    },
    ModelDescriptor {
        vendor: "Rigol",
        model: "DHO804",
        patterns: &["DHO804"],
        capabilities: SCOPE,
        alias: "scope",
        fallback_alias: "scope_rigol",
        supply_channels: &[],
        generator: None,
        scope_channels: 4,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&RIGOL_DHO804),
    },
    ModelDescriptor {
        vendor: "Rigol",
        model: "DHO914S",
        patterns: &["DHO914S"],
        capabilities: SCOPE_WITH_GENERATOR,
        alias: "scope",
        fallback_alias: "scope_dho914s",
        supply_channels: &[],
        generator: Some(GeneratorSpec {
            channels: 1,
            max_frequency: 25.0e6,
            max_amplitude: 5.0,
        }),
        scope_channels: 4,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&RIGOL_DHO914S),
    },
    ModelDescriptor {
        vendor: "HP",
        model: "E3631A",
        patterns: &["E3631A"],
        capabilities: SUPPLY,
        alias: "psu",
        fallback_alias: "psu_hp",
        supply_channels: &[
            ChannelSpec {
                name: "P6V",
                aliases: &["1", "6v", "+6v"],
                min_volts: 0.0,
                max_volts: 6.0,
                max_amps: 5.0,
            },
            ChannelSpec {
                name: "P25V",
                aliases: &["2", "25v", "+25v"],
                min_volts: 0.0,
                max_volts: 25.0,
                max_amps: 1.0,
            },
            ChannelSpec {
                name: "N25V",
                aliases: &["3", "-25v"],
                min_volts: -25.0,
                max_volts: 0.0,
                max_amps: 1.0,
            },
        ],
        generator: None,
        scope_channels: 0,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&HP_E3631A),
    },
    ModelDescriptor {
        vendor: "MATRIX",
        model: "MPS-6010H-1C",
        patterns: &["MPS-6010H"],
        capabilities: SUPPLY,
        alias: "psu",
        fallback_alias: "psu_matrix",
        supply_channels: &[ChannelSpec {
            name: "OUT",
            aliases: &["1", "ch1"],
            min_volts: 0.0,
            max_volts: 60.0,
            max_amps: 10.0,
        }],
        generator: None,
        scope_channels: 0,
        serial_baud: Some(9600),
        write_termination: "\n",
        dialect: Dialect::Scpi(&MATRIX_MPS6010H),
    },
    ModelDescriptor {
        vendor: "HP",
        model: "34401A",
        patterns: &["34401A"],
        capabilities: METER,
        alias: "dmm",
        fallback_alias: "dmm_hp",
        supply_channels: &[],
        generator: None,
        scope_channels: 0,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&HP_34401A),
    },
    ModelDescriptor {
        vendor: "OWON",
        model: "XDM1041",
        patterns: &["XDM1041"],
        capabilities: METER,
        alias: "dmm",
        fallback_alias: "dmm_owon",
        supply_channels: &[],
        generator: None,
        scope_channels: 0,
        serial_baud: Some(115_200),
        write_termination: "\n",
        dialect: Dialect::Scpi(&OWON_XDM1041),
    },
    ModelDescriptor {
        vendor: "B&K Precision",
        model: "4063",
        patterns: &["4063"],
        capabilities: GENERATOR,
        alias: "awg",
        fallback_alias: "awg_bk",
        supply_channels: &[],
        generator: Some(GeneratorSpec {
            channels: 2,
            max_frequency: 60.0e6,
            max_amplitude: 20.0,
        }),
        scope_channels: 0,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&BK_4063),
    },
    ModelDescriptor {
        vendor: "Keysight",
        model: "EDU33212A",
        patterns: &["EDU33212A"],
        capabilities: GENERATOR,
        alias: "awg",
        fallback_alias: "awg_keysight",
        supply_channels: &[],
        generator: Some(GeneratorSpec {
            channels: 2,
            max_frequency: 20.0e6,
            max_amplitude: 10.0,
        }),
        scope_channels: 0,
        serial_baud: None,
        write_termination: "\n",
        dialect: Dialect::Scpi(&KEYSIGHT_EDU33212A),
    },
    ModelDescriptor {
        vendor: "Joy-IT",
        model: "JDS6600",
        patterns: &["JDS6600"],
        capabilities: GENERATOR,
        alias: "awg",
        fallback_alias: "awg_jds",
        supply_channels: &[],
        generator: Some(GeneratorSpec {
            channels: 2,
            max_frequency: 60.0e6,
            max_amplitude: 20.0,
        }),
        scope_channels: 0,
        serial_baud: Some(115_200),
        write_termination: "\r\n",
        dialect: Dialect::Jds6600,
    },
];

/// Fallback identification for devices that ignore `*IDN?`.
pub static IDENTITY_PROBES: &[IdentityProbe] = &[IdentityProbe {
    query: ":r00=",
    expect_prefix: ":r00=",
    identification: "Joy-IT,JDS6600,{response},",
    write_termination: "\r\n",
}];

/// Fields of a comma-separated `*IDN?` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdnFields {
    /// Manufacturer field
    pub vendor: String,
    /// Model field
    pub model: String,
    /// Serial number field
    pub serial_number: String,
    /// Firmware field
    pub firmware: String,
}

/// Split an identification string into its four standard fields.
///
/// Responses without commas land entirely in `model`.
pub fn parse_idn(identification: &str) -> IdnFields {
    let text = identification.trim();
    if !text.contains(',') {
        return IdnFields {
            model: text.to_string(),
            ..Default::default()
        };
    }
    let mut fields = text.splitn(4, ',').map(|f| f.trim().to_string());
    IdnFields {
        vendor: fields.next().unwrap_or_default(),
        model: fields.next().unwrap_or_default(),
        serial_number: fields.next().unwrap_or_default(),
        firmware: fields.next().unwrap_or_default(),
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Resolve an identification string to a known model family.
pub fn resolve(identification: &str) -> Option<&'static ModelDescriptor> {
    let fields = parse_idn(identification);
    let haystack = if fields.model.is_empty() {
        normalize(identification)
    } else {
        normalize(&fields.model)
    };
    MODELS.iter().find(|descriptor| {
        descriptor
            .patterns
            .iter()
            .any(|pattern| haystack.contains(&normalize(pattern)))
    })
}

/// Look a family up by its model name.
pub fn by_model(model: &str) -> Option<&'static ModelDescriptor> {
    MODELS.iter().find(|d| d.model.eq_ignore_ascii_case(model))
}
