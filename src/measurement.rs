//! Labelled measurement log.
//!
//! Supply and meter readings are appended as they are taken, under an
//! operator-chosen `label=` or a label derived from the alias. `log print`
//! renders the table, `log save <path> [csv|txt]` writes it out and `log clear`
//! empties it.

use crate::error::{BenchError, BenchResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// One logged value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Operator label, or `<alias>_<quantity>` when none was given
    pub label: String,
    /// Value in `unit`
    pub value: f64,
    /// Display unit
    pub unit: String,
    /// Alias and verb that produced the value, e.g. `psu.meas`
    pub source: String,
    /// When the value was taken
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Value taken now.
    pub fn new(
        label: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            value,
            unit: unit.into(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// File format for `log save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `timestamp,label,value,unit,source` rows with a header
    Csv,
    /// The same table `log print` shows
    Txt,
}

impl LogFormat {
    /// Format implied by a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl FromStr for LogFormat {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(LogFormat::Csv),
            "txt" | "text" => Ok(LogFormat::Txt),
            _ => Err(BenchError::Usage(format!(
                "unknown log format '{s}' (expected csv or txt)"
            ))),
        }
    }
}

/// Measurements in the order they were taken.
#[derive(Debug, Default)]
pub struct MeasurementLog {
    entries: Vec<Measurement>,
}

impl MeasurementLog {
    /// Append a value.
    pub fn push(&mut self, measurement: Measurement) {
        self.entries.push(measurement);
    }

    /// Every logged value, oldest first.
    pub fn entries(&self) -> &[Measurement] {
        &self.entries
    }

    /// Most recent value logged under `label`.
    pub fn latest(&self, label: &str) -> Option<&Measurement> {
        self.entries.iter().rev().find(|m| m.label == label)
    }

    /// Number of logged values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything; returns how many values were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Fixed-width table of label, value, unit and source.
    pub fn render_table(&self) -> String {
        let header = format!("{:<24} {:>14} {:<8} {:<12}", "Label", "Value", "Unit", "Source");
        let mut text = format!("{header}\n{}", "-".repeat(header.len()));
        for m in &self.entries {
            let _ = write!(
                text,
                "\n{:<24} {:>14} {:<8} {:<12}",
                m.label, m.value, m.unit, m.source
            );
        }
        text
    }

    /// Write the log to `path`. Returns the number of rows written.
    pub fn save(&self, path: &Path, format: LogFormat) -> BenchResult<usize> {
        match format {
            LogFormat::Csv => {
                let mut writer = csv::Writer::from_path(path)?;
                writer.write_record(["timestamp", "label", "value", "unit", "source"])?;
                for m in &self.entries {
                    writer.write_record([
                        m.timestamp.to_rfc3339(),
                        m.label.clone(),
                        m.value.to_string(),
                        m.unit.clone(),
                        m.source.clone(),
                    ])?;
                }
                writer.flush()?;
            }
            LogFormat::Txt => {
                let mut text = self.render_table();
                text.push('\n');
                std::fs::write(path, text)?;
            }
        }
        info!(path = %path.display(), rows = self.entries.len(), ?format, "Measurement log saved");
        Ok(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MeasurementLog {
        let mut log = MeasurementLog::default();
        log.push(Measurement::new("vout", 5.0012, "V", "psu.meas"));
        log.push(Measurement::new("iout", 0.102, "A", "psu.meas"));
        log.push(Measurement::new("vout", 4.9987, "V", "psu.meas"));
        log
    }

    #[test]
    fn latest_value_wins_for_a_label() {
        let log = sample();
        assert_eq!(log.latest("vout").map(|m| m.value), Some(4.9987));
        assert!(log.latest("missing").is_none());
    }

    #[test]
    fn table_lists_every_entry() {
        let table = sample().render_table();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("Label"));
        assert!(lines[3].contains("0.102"));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(LogFormat::from_path(Path::new("run.CSV")), Some(LogFormat::Csv));
        assert_eq!(LogFormat::from_path(Path::new("run.txt")), Some(LogFormat::Txt));
        assert_eq!(LogFormat::from_path(Path::new("run.json")), None);
        assert!("xlsx".parse::<LogFormat>().is_err());
    }

    #[test]
    fn saves_csv_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");

        assert_eq!(sample().save(&path, LogFormat::Csv).unwrap(), 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,label,value,unit,source");
        assert!(lines[1].ends_with(",vout,5.0012,V,psu.meas"), "{}", lines[1]);
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn clear_reports_removed_count() {
        let mut log = sample();
        assert_eq!(log.clear(), 3);
        assert!(log.is_empty());
    }
}
