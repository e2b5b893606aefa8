//! Configuration using Figment
//!
//! Configuration is layered from:
//! 1. `config/lab_bench.toml` (or the path given with `--config`)
//! 2. Environment variables prefixed with `LAB_BENCH_`, nested with `__`
//!
//! Every section has defaults, so a missing file yields a working setup.
//!
//! # Example
//! ```no_run
//! use lab_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! println!("Serial bauds tried: {:?}", config.transport.serial_baud_rates);
//! # Ok::<(), lab_bench::error::BenchError>(())
//! ```
//!
//! `LAB_BENCH_DISCOVERY__PROBE_RETRIES=2` overrides `discovery.probe_retries`.

use crate::error::{BenchError, BenchResult};
use crate::transport::TransportKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_bench.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Per-kind transport settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Discovery behaviour
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Session behaviour
    #[serde(default)]
    pub session: SessionConfig,
    /// Bench-wide caps applied on top of each model's declared limits
    #[serde(default)]
    pub safety: SafetyConfig,
    /// Recorded sequence persistence
    #[serde(default)]
    pub sequences: SequenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Timeouts and serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// USB-TMC operation timeout in milliseconds
    #[serde(default = "default_usb_tmc_timeout")]
    pub usb_tmc_timeout_ms: u64,
    /// GPIB operation timeout in milliseconds
    #[serde(default = "default_gpib_timeout")]
    pub gpib_timeout_ms: u64,
    /// Serial operation timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout_ms: u64,
    /// Baud rates tried in order when identifying a serial device
    #[serde(default = "default_baud_rates")]
    pub serial_baud_rates: Vec<u32>,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Transport kinds enumerated by `scan`
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    /// Extra identification attempts after a transport error
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    /// Addresses containing any of these substrings are never opened
    #[serde(default = "default_skip_patterns")]
    pub skip_patterns: Vec<String>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bind catalog entries to their preferred aliases after each scan
    #[serde(default = "default_true")]
    pub auto_bind: bool,
    /// Drive every bound instrument to its safe state once startup completes
    #[serde(default = "default_true")]
    pub safe_state_on_start: bool,
}

/// Optional global safety caps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Largest voltage magnitude any supply may be set to
    #[serde(default)]
    pub max_voltage: Option<f64>,
    /// Largest current limit any supply may be set to
    #[serde(default)]
    pub max_current: Option<f64>,
    /// Largest generator amplitude (Vpp)
    #[serde(default)]
    pub max_amplitude: Option<f64>,
    /// Largest generator frequency (Hz)
    #[serde(default)]
    pub max_frequency: Option<f64>,
}

/// Sequence store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// JSON file holding recorded sequences; `None` keeps them in memory only
    #[serde(default = "default_sequence_path")]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "lab-bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_usb_tmc_timeout() -> u64 {
    2000
}

fn default_gpib_timeout() -> u64 {
    5000
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_baud_rates() -> Vec<u32> {
    vec![9600, 19200, 115200]
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::ALL.to_vec()
}

fn default_probe_retries() -> u32 {
    1
}

fn default_skip_patterns() -> Vec<String> {
    vec!["Bluetooth".to_string(), "BTHENUM".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_sequence_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lab_bench").join("sequences.json"))
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            usb_tmc_timeout_ms: default_usb_tmc_timeout(),
            gpib_timeout_ms: default_gpib_timeout(),
            serial_timeout_ms: default_serial_timeout(),
            serial_baud_rates: default_baud_rates(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            transports: default_transports(),
            probe_retries: default_probe_retries(),
            skip_patterns: default_skip_patterns(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_bind: true,
            safe_state_on_start: true,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            path: default_sequence_path(),
        }
    }
}

impl TransportConfig {
    /// Operation timeout for a transport kind.
    pub fn timeout_for(&self, kind: TransportKind) -> Duration {
        let ms = match kind {
            TransportKind::UsbTmc => self.usb_tmc_timeout_ms,
            TransportKind::Gpib => self.gpib_timeout_ms,
            TransportKind::Serial => self.serial_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

impl BenchConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> BenchResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let config: BenchConfig = Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LAB_BENCH_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration for tests and the simulated bench.
    ///
    /// Uses short timeouts and never touches the sequence store on disk.
    pub fn ephemeral() -> Self {
        let mut config = Self::default();
        config.transport.usb_tmc_timeout_ms = 200;
        config.transport.gpib_timeout_ms = 200;
        config.transport.serial_timeout_ms = 200;
        config.sequences.path = None;
        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BenchError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(BenchError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let t = &self.transport;
        if t.usb_tmc_timeout_ms == 0 || t.gpib_timeout_ms == 0 || t.serial_timeout_ms == 0 {
            return Err(BenchError::Config(
                "Transport timeouts must be greater than zero".to_string(),
            ));
        }

        if t.serial_baud_rates.is_empty() {
            return Err(BenchError::Config(
                "serial_baud_rates must list at least one rate".to_string(),
            ));
        }

        for (name, cap) in [
            ("max_voltage", self.safety.max_voltage),
            ("max_current", self.safety.max_current),
            ("max_amplitude", self.safety.max_amplitude),
            ("max_frequency", self.safety.max_frequency),
        ] {
            if let Some(value) = cap {
                if !(value.is_finite() && value > 0.0) {
                    return Err(BenchError::Config(format!(
                        "safety.{name} must be a positive number, got {value}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.probe_retries, 1);
        assert_eq!(config.transport.serial_baud_rates, vec![9600, 19200, 115200]);
        assert_eq!(
            config.transport.timeout_for(TransportKind::Gpib),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = BenchConfig::load_from("/nonexistent/lab_bench.toml").unwrap();
        assert_eq!(config.application.name, "lab-bench");
        assert!(config.session.auto_bind);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[transport]
serial_timeout_ms = 250
serial_baud_rates = [115200]

[discovery]
transports = ["serial"]

[safety]
max_voltage = 12.0
"#
        )
        .unwrap();

        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.transport.serial_timeout_ms, 250);
        assert_eq!(config.transport.gpib_timeout_ms, 5000);
        assert_eq!(config.discovery.transports, vec![TransportKind::Serial]);
        assert_eq!(config.safety.max_voltage, Some(12.0));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BenchConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = BenchConfig::default();
        config.transport.serial_baud_rates.clear();
        assert!(config.validate().is_err());

        let mut config = BenchConfig::default();
        config.safety.max_current = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn ephemeral_config_has_no_store() {
        let config = BenchConfig::ephemeral();
        assert!(config.sequences.path.is_none());
        assert!(config.validate().is_ok());
    }
}
